use uuid::Uuid;

use crate::stored_object;

stored_object!(SourceNode, "source_node", {
    source_id: String,
    node_id: String
});

impl SourceNode {
    pub fn new(source_id: String, node_id: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            source_id,
            node_id,
        }
    }
}
