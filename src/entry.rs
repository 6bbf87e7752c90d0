use crate::error::{FloodControlError, Result};
use std::fmt;
use std::str::FromStr;

const SEPARATOR: char = ':';

/// One admitted request as recorded in the window queue.
///
/// Serialized as `"<user_id>:<unix_seconds>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Entry {
    pub user_id: i64,
    pub timestamp: i64,
}

impl Entry {
    /// Constructs a new `Entry`, rejecting timestamps before the Unix epoch.
    pub fn new(user_id: i64, timestamp: i64) -> Result<Self> {
        if timestamp < 0 {
            return Err(FloodControlError::InvalidArgument(format!(
                "timestamp must not be negative, got {}",
                timestamp
            )));
        }
        Ok(Entry { user_id, timestamp })
    }

    /// Seconds elapsed between this entry and `now`.
    pub fn age(&self, now: i64) -> i64 {
        now.saturating_sub(self.timestamp)
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.user_id, SEPARATOR, self.timestamp)
    }
}

impl FromStr for Entry {
    type Err = FloodControlError;

    fn from_str(token: &str) -> Result<Self> {
        let corrupt = |reason: String| FloodControlError::CorruptEntry {
            token: token.to_owned(),
            reason,
        };

        let parts: Vec<&str> = token.split(SEPARATOR).collect();
        if parts.len() != 2 {
            return Err(corrupt(format!(
                "expected 2 fields separated by '{}', found {}",
                SEPARATOR,
                parts.len()
            )));
        }

        let user_id = parse_field(parts[0], true)
            .map_err(|reason| corrupt(format!("user id {:?} {}", parts[0], reason)))?;
        let timestamp = parse_field(parts[1], false)
            .map_err(|reason| corrupt(format!("timestamp {:?} {}", parts[1], reason)))?;

        Ok(Entry { user_id, timestamp })
    }
}

/// Parses a field written by `Display`: decimal digits with no leading zeros
/// and no `+`, optionally preceded by `-` when `signed`.
fn parse_field(field: &str, signed: bool) -> std::result::Result<i64, String> {
    let digits = match field.strip_prefix('-') {
        Some(digits) if signed => digits,
        Some(_) => return Err("is negative".into()),
        None => field,
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err("is not a decimal integer".into());
    }
    if (digits.len() > 1 && digits.starts_with('0')) || field == "-0" {
        return Err("is not in canonical form".into());
    }
    field.parse::<i64>().map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encodes_user_and_unix_seconds() {
        let entry = Entry::new(42, 1_700_000_000).unwrap();
        assert_eq!(entry.encode(), "42:1700000000");
        assert_eq!("42:1700000000".parse::<Entry>().unwrap(), entry);
    }

    #[test]
    fn test_negative_user_ids_survive_decoding() {
        let entry: Entry = "-7:15".parse().unwrap();
        assert_eq!(entry.user_id, -7);
        assert_eq!(entry.timestamp, 15);
    }

    #[test]
    fn test_rejects_wrong_field_count() {
        for token in ["", "42", "1:2:3", "42:"] {
            let err = token.parse::<Entry>().unwrap_err();
            assert!(
                matches!(err, FloodControlError::CorruptEntry { .. }),
                "token {:?} gave {:?}",
                token,
                err
            );
        }
    }

    #[test]
    fn test_rejects_non_numeric_fields() {
        assert!(matches!(
            "abc:10".parse::<Entry>(),
            Err(FloodControlError::CorruptEntry { .. })
        ));
        assert!(matches!(
            "10:yesterday".parse::<Entry>(),
            Err(FloodControlError::CorruptEntry { .. })
        ));
        assert!(matches!(
            "10:-5".parse::<Entry>(),
            Err(FloodControlError::CorruptEntry { .. })
        ));
    }

    #[test]
    fn test_rejects_non_canonical_integers() {
        for token in ["+5:10", "05:10", "5:010", "5:+10", "-0:3", "00:1", "5: 10"] {
            assert!(
                matches!(
                    token.parse::<Entry>(),
                    Err(FloodControlError::CorruptEntry { .. })
                ),
                "token {:?} was accepted",
                token
            );
        }
        assert_eq!("0:0".parse::<Entry>().unwrap(), Entry::new(0, 0).unwrap());
        assert_eq!(
            "-9223372036854775808:9223372036854775807"
                .parse::<Entry>()
                .unwrap()
                .user_id,
            i64::MIN
        );
        assert!("9223372036854775808:1".parse::<Entry>().is_err());
    }

    #[test]
    fn test_new_rejects_negative_timestamp() {
        assert!(matches!(
            Entry::new(1, -1),
            Err(FloodControlError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_age_is_measured_in_seconds() {
        let entry = Entry::new(1, 10).unwrap();
        assert_eq!(entry.age(70), 60);
        assert_eq!(entry.age(10), 0);
    }
}
