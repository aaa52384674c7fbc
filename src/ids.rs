use rand::rngs::OsRng;
use rand::RngCore;
use uuid::Uuid;

/// Generate a 128-bit hex id for invocations and build entries. Falls back
/// to a timestamp-derived id only if the OS RNG is unavailable.
pub fn generate_call_id() -> String {
    let mut buf = [0u8; 16];
    match OsRng.try_fill_bytes(&mut buf) {
        Ok(()) => Uuid::from_bytes(buf).simple().to_string(),
        Err(_) => format!("call-{}", chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_ids_are_hex_and_unique() {
        let a = generate_call_id();
        let b = generate_call_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
