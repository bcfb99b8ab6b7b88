use uuid::Uuid;

use crate::stored_object;

stored_object!(SourceEdge, "source_edge", {
    source_id: String,
    edge_id: String
});

impl SourceEdge {
    pub fn new(source_id: String, edge_id: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            source_id,
            edge_id,
        }
    }
}
