#![allow(dead_code)]

use memotrack::{
    ContextConfig, DataType, DbContext, DeleteBehavior, EntityTypeBuilder, MemoryExecutor,
    MemoryStore, Model, OwnedType, Property, RelationshipBuilder, Result, Value,
};
use std::sync::Arc;

pub type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

/// Which shape of the Player → Item ownership the fixture declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Every item has an owner; replacing it deletes the old item.
    Required,
    /// Items may be ownerless; replacing one only clears its owner.
    Optional,
}

pub fn player() -> EntityTypeBuilder {
    EntityTypeBuilder::new("Player")
        .generated_key("PlayerId")
        .property(Property::new("Name", DataType::Text).not_null())
        .shadow_property(Property::new("GuildId", DataType::Integer))
        .owns_one(OwnedType::new("Stats").property(Property::new("Level", DataType::Integer)))
        .unique(&["Name"])
}

pub fn item(ownership: Ownership) -> EntityTypeBuilder {
    let owner = Property::new("OwnerId", DataType::Integer);
    let owner = match ownership {
        Ownership::Required => owner.not_null(),
        Ownership::Optional => owner,
    };
    EntityTypeBuilder::new("Item")
        .generated_key("ItemId")
        .property(Property::new("Type", DataType::Integer).not_null())
        .property(Property::new("TemplateId", DataType::Integer).not_null())
        .property(Property::new("CreateDate", DataType::Timestamp).not_null().default_now())
        .property(owner)
        .property(Property::new("CreatorId", DataType::Integer))
        .shadow_property(Property::new("RecoveredDate", DataType::Timestamp))
        .discriminator("Type")
        .discriminator_value(0)
        .owns_one(
            OwnedType::new("Option")
                .property(Property::new("Name", DataType::Text))
                .property(Property::new("Power", DataType::Integer))
                .to_table("ItemOption"),
        )
}

pub fn event_item() -> EntityTypeBuilder {
    EntityTypeBuilder::new("EventItem")
        .derives_from("Item")
        .discriminator_value(1)
        .property(Property::new("DestroyAt", DataType::Timestamp))
}

pub fn guild() -> EntityTypeBuilder {
    EntityTypeBuilder::new("Guild")
        .generated_key("GuildId")
        .property(Property::new("GuildName", DataType::Text).not_null())
}

pub fn review() -> EntityTypeBuilder {
    EntityTypeBuilder::new("ItemReview")
        .generated_key("ItemReviewId")
        .property(Property::new("Value", DataType::Integer).not_null())
        .shadow_property(Property::new("ItemId", DataType::Integer))
}

/// The game model: players own one item each, create many, join guilds;
/// items carry reviews.
pub fn game_model(ownership: Ownership) -> Model {
    game_model_with(ownership, false)
}

/// `store_cascade`: the store itself deletes items with their owner.
pub fn game_model_with(ownership: Ownership, store_cascade: bool) -> Model {
    let owner = RelationshipBuilder::one_to_one("Player", "Item")
        .named("FK_Item_Player_OwnerId")
        .foreign_key(&["OwnerId"])
        .principal_navigation("OwnedItem")
        .dependent_navigation("Owner");
    let owner = match ownership {
        Ownership::Required => owner.required(),
        Ownership::Optional => owner,
    };
    let owner = if store_cascade { owner.store_cascade() } else { owner };

    Model::builder()
        .entity(player())
        .entity(item(ownership))
        .entity(event_item())
        .entity(guild())
        .entity(review())
        .relationship(owner)
        .relationship(
            RelationshipBuilder::one_to_many("Player", "Item")
                .named("FK_Item_Player_CreatorId")
                .foreign_key(&["CreatorId"])
                .principal_navigation("CreatedItems")
                .dependent_navigation("Creator"),
        )
        .relationship(
            RelationshipBuilder::one_to_many("Guild", "Player")
                .named("FK_Player_Guild_GuildId")
                .foreign_key(&["GuildId"])
                .principal_navigation("Members")
                .dependent_navigation("Guild"),
        )
        .relationship(
            RelationshipBuilder::one_to_many("Item", "ItemReview")
                .named("FK_ItemReview_Item_ItemId")
                .foreign_key(&["ItemId"])
                .principal_navigation("Reviews")
                .on_delete(DeleteBehavior::ClientSetNull),
        )
        .build()
        .expect("game model builds")
}

pub fn setup(ownership: Ownership) -> (MemoryStore, DbContext<MemoryExecutor>) {
    setup_with(game_model(ownership), ContextConfig::default())
}

pub fn setup_with(model: Model, config: ContextConfig) -> (MemoryStore, DbContext<MemoryExecutor>) {
    let model = Arc::new(model);
    let store = MemoryStore::from_model(Arc::clone(&model)).expect("store schema");
    let ctx = DbContext::with_config(model, store.executor(), config).expect("valid config");
    (store, ctx)
}

/// A second unit of work over the same store.
pub fn reopen(store: &MemoryStore) -> DbContext<MemoryExecutor> {
    DbContext::new(Arc::clone(store.model()), store.executor())
}

pub fn new_player(ctx: &mut DbContext<MemoryExecutor>, name: &str) -> Result<memotrack::EntityId> {
    let player = ctx.create("Player")?;
    ctx.set_value(player, "Name", name)?;
    Ok(player)
}

pub fn new_item(ctx: &mut DbContext<MemoryExecutor>, template: i64) -> Result<memotrack::EntityId> {
    let item = ctx.create("Item")?;
    ctx.set_value(item, "TemplateId", template)?;
    Ok(item)
}

/// Saves a player owning a fresh item and returns their store keys.
pub async fn seed_player_with_item(store: &MemoryStore, name: &str) -> Result<(i64, i64)> {
    let mut ctx = reopen(store);
    let player = new_player(&mut ctx, name)?;
    let item = new_item(&mut ctx, 101)?;
    ctx.set_reference(player, "OwnedItem", Some(item))?;
    ctx.track_new(player)?;
    ctx.save().await?;
    let player_id = ctx.value(player, "PlayerId")?.as_i64().unwrap_or_default();
    let item_id = ctx.value(item, "ItemId")?.as_i64().unwrap_or_default();
    Ok((player_id, item_id))
}

/// Materializes the stored row of `entity_type` with integer key `id`.
pub async fn load(
    store: &MemoryStore,
    ctx: &mut DbContext<MemoryExecutor>,
    entity_type: &str,
    id: i64,
) -> Result<memotrack::EntityId> {
    let row = store
        .find(entity_type, &memotrack::Key::single(id))
        .await
        .expect("store read")
        .expect("row exists");
    ctx.materialize(entity_type, &row)
}

pub fn int(value: Value) -> i64 {
    value.as_i64().expect("integer value")
}
