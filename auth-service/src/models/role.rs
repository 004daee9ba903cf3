use sqlx::FromRow;

/// Role catalogue entry.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Role {
    pub id: i16,
    pub name: String,
    /// Whether a user may pick this role at registration.
    pub self_assignable: bool,
}

impl Role {
    pub fn new(id: i16, name: &str, self_assignable: bool) -> Self {
        Self {
            id,
            name: name.to_string(),
            self_assignable,
        }
    }

    /// The catalogue seeded by the initial migration.
    pub fn seeded() -> Vec<Role> {
        vec![
            Role::new(1, "USER", true),
            Role::new(2, "CREATOR", true),
            Role::new(3, "EDITOR", true),
            Role::new(4, "ADMIN", false),
        ]
    }
}
