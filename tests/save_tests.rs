/// Save pipeline tests
///
/// Inserts, updates and deletes against the in-memory store: generated key
/// propagation, transaction rollback, interceptors and idempotent saves.
/// Run with: cargo test --test save_tests

mod common;

use common::{
    Ownership, TestResult, int, load, new_item, new_player, reopen, seed_player_with_item, setup,
    setup_with, game_model,
};
use memotrack::{
    ChangeTracker, ContextConfig, CreatedAtInterceptor, DataType, DbContext, EntityState,
    EntityTypeBuilder, GraphNode, Key, Model, Property, Result,
    SaveInterceptor, SaveReport, StoreError, TrackError, UuidGenerator, Value,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[tokio::test]
async fn test_insert_graph_propagates_generated_keys() -> TestResult {
    let (store, mut ctx) = setup(Ownership::Required);
    let player = new_player(&mut ctx, "Rookiss")?;
    let item = new_item(&mut ctx, 101)?;
    ctx.set_reference(player, "OwnedItem", Some(item))?;
    ctx.track_new(player)?;

    let report = ctx.save().await?;

    assert_eq!(report.inserted, 2);
    assert_eq!(report.commands[0].table, "Player");
    assert_eq!(report.commands[1].table, "Item");
    let player_id = ctx.value(player, "PlayerId")?;
    assert_eq!(player_id, Value::Integer(1));
    assert_eq!(ctx.value(item, "OwnerId")?, player_id);
    assert_eq!(ctx.state_of(player), EntityState::Unchanged);
    assert_eq!(ctx.state_of(item), EntityState::Unchanged);

    let item_id = ctx.value(item, "ItemId")?;
    assert_eq!(report.commands[1].key, Key::single(item_id.clone()));
    let stored = store.row("Item", &Key::single(item_id)).await?.expect("item row");
    assert_eq!(stored["OwnerId"], player_id);
    assert_eq!(stored["Type"], Value::Integer(0));
    assert!(stored["CreateDate"].as_timestamp().is_some());
    assert_eq!(ctx.value(item, "CreateDate")?, stored["CreateDate"]);
    Ok(())
}

#[tokio::test]
async fn test_second_save_is_idempotent() -> TestResult {
    let (_store, mut ctx) = setup(Ownership::Required);
    let player = new_player(&mut ctx, "Rookiss")?;
    ctx.track_new(player)?;
    ctx.save().await?;

    assert!(!ctx.has_changes());
    let report = ctx.save().await?;
    assert!(report.is_empty());
    assert_eq!(report, SaveReport::default());
    Ok(())
}

#[tokio::test]
async fn test_update_writes_only_modified_columns() -> TestResult {
    let (store, _) = setup(Ownership::Required);
    let (player_id, _) = seed_player_with_item(&store, "Rookiss").await?;

    let mut ctx = reopen(&store);
    let player = load(&store, &mut ctx, "Player", player_id).await?;
    ctx.set_value(player, "Name", "Renamed")?;
    let report = ctx.save().await?;

    assert_eq!(report.updated, 1);
    assert_eq!(report.commands[0].columns, vec!["Name".to_string()]);
    let stored = store.row("Player", &Key::single(player_id)).await?.expect("player row");
    assert_eq!(stored["Name"], Value::from("Renamed"));
    assert_eq!(ctx.state_of(player), EntityState::Unchanged);
    Ok(())
}

#[tokio::test]
async fn test_new_principal_key_flows_into_tracked_dependent() -> TestResult {
    let (store, _) = setup(Ownership::Required);
    let (player_id, _) = seed_player_with_item(&store, "Rookiss").await?;

    let mut ctx = reopen(&store);
    let player = load(&store, &mut ctx, "Player", player_id).await?;
    let guild = ctx.create("Guild")?;
    ctx.set_value(guild, "GuildName", "Red")?;
    ctx.set_reference(player, "Guild", Some(guild))?;
    assert_eq!(ctx.state_of(guild), EntityState::Added);
    assert_eq!(ctx.state_of(player), EntityState::Modified);

    let report = ctx.save().await?;

    assert_eq!((report.inserted, report.updated, report.deleted), (1, 1, 0));
    let guild_id = ctx.value(guild, "GuildId")?;
    assert_eq!(ctx.value(player, "GuildId")?, guild_id);
    let stored = store.row("Player", &Key::single(player_id)).await?.expect("player row");
    assert_eq!(stored["GuildId"], guild_id);
    Ok(())
}

#[tokio::test]
async fn test_reassigning_optional_principal_updates_only_dependent() -> TestResult {
    let (store, _) = setup(Ownership::Required);
    let (_, item_id) = seed_player_with_item(&store, "Rookiss").await?;
    let (other_id, _) = seed_player_with_item(&store, "Faker").await?;

    let mut ctx = reopen(&store);
    let item = load(&store, &mut ctx, "Item", item_id).await?;
    let other = load(&store, &mut ctx, "Player", other_id).await?;
    ctx.set_reference(item, "Creator", Some(other))?;
    let report = ctx.save().await?;

    assert_eq!(report.updated, 1);
    assert_eq!(report.commands[0].entity_type, "Item");
    assert_eq!(ctx.collection(other, "CreatedItems")?, vec![item]);
    let stored = store.row("Item", &Key::single(item_id)).await?.expect("item row");
    assert_eq!(stored["CreatorId"], Value::Integer(other_id));
    Ok(())
}

#[tokio::test]
async fn test_deleted_entity_is_removed_and_forgotten() -> TestResult {
    let (store, _) = setup(Ownership::Required);
    let (_, item_id) = seed_player_with_item(&store, "Rookiss").await?;

    let mut ctx = reopen(&store);
    let item = load(&store, &mut ctx, "Item", item_id).await?;
    ctx.mark_for_deletion(item)?;
    let report = ctx.save().await?;

    assert_eq!(report.deleted, 1);
    assert_eq!(store.row_count("Item").await?, 0);
    assert_eq!(ctx.state_of(item), EntityState::Detached);
    assert_eq!(ctx.find_entry("Item", &Key::single(item_id)), None);
    Ok(())
}

#[tokio::test]
async fn test_failed_save_rolls_back_and_keeps_states() -> TestResult {
    let (store, _) = setup(Ownership::Required);
    seed_player_with_item(&store, "Rookiss").await?;

    let mut ctx = reopen(&store);
    let faker = new_player(&mut ctx, "Faker")?;
    let duplicate = new_player(&mut ctx, "Rookiss")?;
    ctx.track_new(faker)?;
    ctx.track_new(duplicate)?;

    let err = ctx.save().await.unwrap_err();
    assert!(
        matches!(
            err,
            TrackError::Persistence {
                source: StoreError::UniqueViolation { .. },
                ..
            }
        ),
        "got {err:?}"
    );
    assert_eq!(store.row_count("Player").await?, 1);
    assert_eq!(ctx.state_of(faker), EntityState::Added);
    assert_eq!(ctx.state_of(duplicate), EntityState::Added);
    assert_eq!(ctx.value(faker, "PlayerId")?, Value::Null);

    ctx.set_value(duplicate, "Name", "Deft")?;
    let report = ctx.save().await?;
    assert_eq!(report.inserted, 2);
    assert_eq!(store.row_count("Player").await?, 3);
    Ok(())
}

#[tokio::test]
async fn test_auto_detection_can_be_disabled() -> TestResult {
    let (store, _) = setup(Ownership::Required);
    let (player_id, _) = seed_player_with_item(&store, "Rookiss").await?;

    let config = ContextConfig::new().auto_detect_changes(false);
    let mut ctx = DbContext::with_config(Arc::clone(store.model()), store.executor(), config)?;
    let player = load(&store, &mut ctx, "Player", player_id).await?;
    ctx.values_mut(player)?.insert("Name".into(), "Renamed".into());

    assert!(ctx.save().await?.is_empty());
    ctx.detect_changes()?;
    assert_eq!(ctx.save().await?.updated, 1);
    Ok(())
}

#[tokio::test]
async fn test_bulk_update_rewrites_every_column() -> TestResult {
    let (store, _) = setup(Ownership::Required);
    let (player_id, _) = seed_player_with_item(&store, "Rookiss").await?;

    let mut ctx = reopen(&store);
    let player = new_player(&mut ctx, "Rookiss")?;
    ctx.set_value(player, "PlayerId", player_id)?;
    ctx.set_value(player, "Stats.Level", 30i64)?;
    ctx.replace_with_bulk_update(player)?;
    let report = ctx.save().await?;

    assert_eq!(report.updated, 1);
    let columns = &report.commands[0].columns;
    assert!(columns.contains(&"Name".to_string()));
    assert!(columns.contains(&"Stats_Level".to_string()));
    let stored = store.row("Player", &Key::single(player_id)).await?.expect("player row");
    assert_eq!(stored["Stats_Level"], Value::Integer(30));
    Ok(())
}

#[tokio::test]
async fn test_visitor_partial_update_leaves_other_columns() -> TestResult {
    let (store, _) = setup(Ownership::Required);
    let (player_id, _) = seed_player_with_item(&store, "Rookiss").await?;

    let mut ctx = reopen(&store);
    let player = new_player(&mut ctx, "Renamed")?;
    ctx.set_value(player, "PlayerId", player_id)?;
    ctx.set_value(player, "Stats.Level", 99i64)?;
    ctx.walk_graph(player, |node: &mut GraphNode<'_>| {
        if node.entity_type() == "Player" {
            node.mark_modified("Name");
        }
    })?;
    let report = ctx.save().await?;

    assert_eq!(report.commands[0].columns, vec!["Name".to_string()]);
    let stored = store.row("Player", &Key::single(player_id)).await?.expect("player row");
    assert_eq!(stored["Name"], Value::from("Renamed"));
    assert_eq!(stored["Stats_Level"], Value::Null);
    Ok(())
}

#[tokio::test]
async fn test_reload_refreshes_from_store() -> TestResult {
    let (store, _) = setup(Ownership::Required);
    let (player_id, _) = seed_player_with_item(&store, "Rookiss").await?;
    let key = Key::single(player_id);

    let mut stale = reopen(&store);
    let player = load(&store, &mut stale, "Player", player_id).await?;

    let mut writer = reopen(&store);
    let copy = load(&store, &mut writer, "Player", player_id).await?;
    writer.set_value(copy, "Name", "Renamed")?;
    writer.save().await?;

    let row = store.find("Player", &key).await?;
    stale.reload(player, row.as_ref())?;
    assert_eq!(stale.value(player, "Name")?, Value::from("Renamed"));
    assert_eq!(stale.state_of(player), EntityState::Unchanged);

    stale.reload(player, None)?;
    assert_eq!(stale.state_of(player), EntityState::Detached);
    Ok(())
}

#[tokio::test]
async fn test_client_generated_key_and_defaults() -> TestResult {
    let model = Model::builder()
        .entity(
            EntityTypeBuilder::new("Token")
                .key(&["Code"])
                .property(Property::new("Code", DataType::Text).generated_by(UuidGenerator))
                .property(Property::new("Scope", DataType::Text).not_null().default_value("read")),
        )
        .build()?;
    let (store, mut ctx) = setup_with(model, ContextConfig::default());
    let token = ctx.create("Token")?;
    ctx.track_new(token)?;
    ctx.save().await?;

    let code = ctx.value(token, "Code")?;
    assert_eq!(code.as_str().map(str::len), Some(36));
    assert_eq!(ctx.value(token, "Scope")?, Value::from("read"));
    assert_eq!(ctx.find_entry("Token", &Key::single(code.clone())), Some(token));
    assert!(store.row("Token", &Key::single(code)).await?.is_some());
    Ok(())
}

// ============================================================================
// Interceptors
// ============================================================================

struct Veto;

impl SaveInterceptor for Veto {
    fn saving_changes(&self, _tracker: &mut ChangeTracker) -> Result<()> {
        Err(TrackError::Config("saves are frozen".into()))
    }
}

struct Counting {
    commands: Arc<AtomicUsize>,
}

impl SaveInterceptor for Counting {
    fn saving_changes(&self, _tracker: &mut ChangeTracker) -> Result<()> {
        Ok(())
    }

    fn saved_changes(&self, report: &SaveReport) {
        self.commands.fetch_add(report.total(), Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_interceptor_error_aborts_before_any_command() -> TestResult {
    let (store, mut ctx) = setup(Ownership::Required);
    ctx.add_interceptor(Veto);
    let player = new_player(&mut ctx, "Rookiss")?;
    ctx.track_new(player)?;

    let err = ctx.save().await.unwrap_err();
    assert!(matches!(err, TrackError::Config(_)), "got {err:?}");
    assert_eq!(store.row_count("Player").await?, 0);
    assert_eq!(ctx.state_of(player), EntityState::Added);
    Ok(())
}

#[tokio::test]
async fn test_interceptors_observe_and_stamp() -> TestResult {
    let (store, mut ctx) = setup(Ownership::Required);
    let commands = Arc::new(AtomicUsize::new(0));
    ctx.add_interceptor(Counting {
        commands: Arc::clone(&commands),
    });
    ctx.add_interceptor(CreatedAtInterceptor::new("RecoveredDate"));

    let player = new_player(&mut ctx, "Rookiss")?;
    let item = new_item(&mut ctx, 101)?;
    ctx.set_reference(player, "OwnedItem", Some(item))?;
    ctx.track_new(player)?;
    let before = chrono::Utc::now();
    ctx.save().await?;

    assert_eq!(commands.load(Ordering::SeqCst), 2);
    let stamped = ctx.value(item, "RecoveredDate")?.as_timestamp().expect("stamped");
    assert!(stamped >= before);
    let item_id = ctx.value(item, "ItemId")?;
    let stored = store.row("Item", &Key::single(item_id)).await?.expect("item row");
    assert_eq!(stored["RecoveredDate"], Value::Timestamp(stamped));
    Ok(())
}

#[tokio::test]
async fn test_separate_contexts_share_one_store() -> TestResult {
    let (store, _) = setup(Ownership::Optional);
    let mut first = reopen(&store);
    let mut second = reopen(&store);

    let a = new_player(&mut first, "Rookiss")?;
    first.track_new(a)?;
    let b = new_player(&mut second, "Faker")?;
    second.track_new(b)?;
    first.save().await?;
    second.save().await?;

    assert_eq!(int(first.value(a, "PlayerId")?), 1);
    assert_eq!(int(second.value(b, "PlayerId")?), 2);
    assert_eq!(store.query("Player").await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_game_model_builds_for_both_ownerships() {
    for ownership in [Ownership::Required, Ownership::Optional] {
        let model = game_model(ownership);
        let owner = model
            .relationships()
            .iter()
            .find(|r| r.name() == "FK_Item_Player_OwnerId")
            .expect("owner relationship");
        assert_eq!(owner.is_required(), ownership == Ownership::Required);
    }
}
