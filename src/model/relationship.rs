use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    OneToOne,
    OneToMany,
}

/// What happens to tracked dependents when their principal is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteBehavior {
    /// Dependents are removed with the principal.
    Cascade,
    /// Dependents' foreign keys are set to NULL.
    ClientSetNull,
    /// Dependents are left alone; the save fails while they still refer to
    /// the principal.
    Restrict,
}

impl fmt::Display for DeleteBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cascade => write!(f, "CASCADE"),
            Self::ClientSetNull => write!(f, "CLIENT SET NULL"),
            Self::Restrict => write!(f, "RESTRICT"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Relationship {
    pub(crate) name: String,
    pub(crate) principal: String,
    pub(crate) dependent: String,
    pub(crate) cardinality: Cardinality,
    pub(crate) foreign_key: Vec<String>,
    pub(crate) principal_key: Vec<String>,
    pub(crate) principal_navigation: Option<String>,
    pub(crate) dependent_navigation: Option<String>,
    pub(crate) required: bool,
    pub(crate) on_delete: DeleteBehavior,
    pub(crate) store_cascade: bool,
}

impl Relationship {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn dependent(&self) -> &str {
        &self.dependent
    }

    pub fn cardinality(&self) -> Cardinality {
        self.cardinality
    }

    pub fn foreign_key(&self) -> &[String] {
        &self.foreign_key
    }

    pub fn principal_key(&self) -> &[String] {
        &self.principal_key
    }

    /// Navigation on the principal pointing at its dependent(s).
    pub fn principal_navigation(&self) -> Option<&str> {
        self.principal_navigation.as_deref()
    }

    /// Navigation on the dependent pointing at its principal.
    pub fn dependent_navigation(&self) -> Option<&str> {
        self.dependent_navigation.as_deref()
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn on_delete(&self) -> DeleteBehavior {
        self.on_delete
    }

    /// The store declares ON DELETE CASCADE for this foreign key.
    pub fn store_cascade(&self) -> bool {
        self.store_cascade
    }

    /// Severing a dependent from its principal removes the dependent.
    pub fn deletes_orphans(&self) -> bool {
        self.required && self.on_delete == DeleteBehavior::Cascade
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationSide {
    /// Dependent → principal reference.
    ToPrincipal,
    /// Principal → dependent reference (1:1) or collection (1:N).
    ToDependent,
}

#[derive(Debug, Clone, Copy)]
pub struct Navigation<'a> {
    pub relationship: &'a Relationship,
    pub index: usize,
    pub side: NavigationSide,
}

impl Navigation<'_> {
    pub fn is_collection(&self) -> bool {
        self.side == NavigationSide::ToDependent
            && self.relationship.cardinality == Cardinality::OneToMany
    }

    pub fn target_type(&self) -> &str {
        match self.side {
            NavigationSide::ToPrincipal => &self.relationship.principal,
            NavigationSide::ToDependent => &self.relationship.dependent,
        }
    }
}

/// Fluent relationship declaration, mirroring `HasOne(..).WithMany(..)`.
#[derive(Debug, Clone)]
pub struct RelationshipBuilder {
    pub(crate) name: Option<String>,
    pub(crate) principal: String,
    pub(crate) dependent: String,
    pub(crate) cardinality: Cardinality,
    pub(crate) foreign_key: Vec<String>,
    pub(crate) principal_navigation: Option<String>,
    pub(crate) dependent_navigation: Option<String>,
    pub(crate) required: bool,
    pub(crate) on_delete: Option<DeleteBehavior>,
    pub(crate) store_cascade: bool,
}

impl RelationshipBuilder {
    fn new(principal: &str, dependent: &str, cardinality: Cardinality) -> Self {
        Self {
            name: None,
            principal: principal.to_string(),
            dependent: dependent.to_string(),
            cardinality,
            foreign_key: Vec::new(),
            principal_navigation: None,
            dependent_navigation: None,
            required: false,
            on_delete: None,
            store_cascade: false,
        }
    }

    pub fn one_to_many(principal: &str, dependent: &str) -> Self {
        Self::new(principal, dependent, Cardinality::OneToMany)
    }

    pub fn one_to_one(principal: &str, dependent: &str) -> Self {
        Self::new(principal, dependent, Cardinality::OneToOne)
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn foreign_key(mut self, properties: &[&str]) -> Self {
        self.foreign_key = properties.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn principal_navigation(mut self, navigation: &str) -> Self {
        self.principal_navigation = Some(navigation.to_string());
        self
    }

    pub fn dependent_navigation(mut self, navigation: &str) -> Self {
        self.dependent_navigation = Some(navigation.to_string());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn on_delete(mut self, behavior: DeleteBehavior) -> Self {
        self.on_delete = Some(behavior);
        self
    }

    pub fn store_cascade(mut self) -> Self {
        self.store_cascade = true;
        self
    }
}
