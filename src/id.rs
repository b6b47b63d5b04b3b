use uuid::Uuid;

/// Returns a random RFC 4122 (v4) identifier.
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}
