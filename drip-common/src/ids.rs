use uuid::Uuid;

/// Length of the random suffix attached to server-assigned identifiers.
const SHORT_ID_LEN: usize = 12;

/// A short, collision-resistant identifier suffix. 12 hex characters of a
/// random UUID keep identifiers readable in logs while staying unique for
/// any realistic process lifetime.
pub fn short_uuid() -> String {
    let mut buf = Uuid::encode_buffer();
    let simple = Uuid::new_v4().simple().encode_lower(&mut buf);
    simple[..SHORT_ID_LEN].to_owned()
}

pub fn batch_id() -> String {
    format!("batch_{}", short_uuid())
}

pub fn job_id() -> String {
    format!("job_{}", short_uuid())
}

pub fn single_row_id() -> String {
    format!("single_{}", short_uuid())
}
