use crate::se;

pub fn now_seconds() -> crate::Result<i64> {
    Ok(std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|e| se!("invalid duration {}", e))?
        .as_secs() as i64)
}

/// Convert a spotify `expires_in` (seconds from now) to an absolute
/// epoch timestamp, minus a minute of leeway so we refresh slightly
/// before the token actually dies.
pub fn epoch_expiration(expires_in: u64) -> crate::Result<i64> {
    Ok(now_seconds()? + expires_in.saturating_sub(60) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiration_applies_a_refresh_leeway() {
        let now = now_seconds().unwrap();
        let expires = epoch_expiration(3600).unwrap();
        let delta = expires - now;
        assert!((3538..=3542).contains(&delta), "unexpected delta {}", delta);
    }

    #[test]
    fn short_expirations_saturate_instead_of_underflowing() {
        let now = now_seconds().unwrap();
        let expires = epoch_expiration(30).unwrap();
        assert!(expires >= now);
        assert!(expires <= now + 2);
    }
}
