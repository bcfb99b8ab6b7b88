use crate::stored_object;

stored_object!(Encryption, "encryption", {
    key: String,
    ciphertext: String
});

impl Encryption {
    pub fn new(key: String, ciphertext: String) -> Self {
        let now = Utc::now();
        Self {
            id: key.clone(),
            created_at: now,
            updated_at: now,
            key,
            ciphertext,
        }
    }
}
