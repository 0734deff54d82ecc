use std::str::FromStr;

use crate::SessionError;

/// Host input devices a virtual keyboard frontend asks for. An empty id means "none".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub keyboard: String,
    pub pointer: String,
    pub touch: String,
}

/// Parse a `;`-separated list of `KEY:VALUE` tokens, where `KEY` is `K` (keyboard), `P`
/// (pointer) or `T` (touch), in either case. Empty tokens are skipped; a later token for the
/// same key wins.
pub fn parse_identity(identity: &str) -> Result<DeviceIdentity, SessionError> {
    let invalid = |reason: String| SessionError::InvalidIdentity {
        identity: identity.to_owned(),
        reason,
    };

    let mut parsed = DeviceIdentity::default();
    for token in identity.split(';').filter(|t| !t.is_empty()) {
        let (key, value) = token
            .split_once(':')
            .ok_or_else(|| invalid(format!("token {token:?} has no ':'")))?;
        let slot = match key.to_ascii_uppercase().as_str() {
            "K" => &mut parsed.keyboard,
            "P" => &mut parsed.pointer,
            "T" => &mut parsed.touch,
            _ => return Err(invalid(format!("unknown key {key:?}"))),
        };
        *slot = value.to_owned();
    }
    Ok(parsed)
}

impl FromStr for DeviceIdentity {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_identity(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(keyboard: &str, pointer: &str, touch: &str) -> DeviceIdentity {
        DeviceIdentity {
            keyboard: keyboard.into(),
            pointer: pointer.into(),
            touch: touch.into(),
        }
    }

    #[test]
    fn keyboard_and_pointer() {
        assert_eq!(parse_identity("K:kbd0;P:ptr0").unwrap(), identity("kbd0", "ptr0", ""));
    }

    #[test]
    fn unknown_key_is_invalid() {
        assert!(matches!(
            parse_identity("X:foo"),
            Err(SessionError::InvalidIdentity { .. })
        ));
    }

    #[test]
    fn keys_are_case_insensitive() {
        assert_eq!(parse_identity("k:a;p:b;t:c").unwrap(), identity("a", "b", "c"));
    }

    #[test]
    fn empty_tokens_and_values() {
        assert_eq!(parse_identity("").unwrap(), DeviceIdentity::default());
        assert_eq!(parse_identity(";;T:touch0;").unwrap(), identity("", "", "touch0"));
        assert_eq!(parse_identity("K:").unwrap(), DeviceIdentity::default());
    }

    #[test]
    fn value_may_contain_colons() {
        assert_eq!(
            "P:/dev/input/by-id/usb-mouse:event".parse::<DeviceIdentity>().unwrap(),
            identity("", "/dev/input/by-id/usb-mouse:event", "")
        );
    }

    #[test]
    fn token_without_separator_is_invalid() {
        assert!(matches!(
            parse_identity("K:kbd0;pointer"),
            Err(SessionError::InvalidIdentity { .. })
        ));
    }

    #[test]
    fn later_token_wins() {
        assert_eq!(parse_identity("K:a;K:b").unwrap(), identity("b", "", ""));
    }

    proptest::proptest! {
        #[test]
        fn arbitrary_input_never_panics(s in ".{0,64}") {
            let _ = parse_identity(&s);
        }

        #[test]
        fn device_ids_survive_any_key_order(
            k in "[a-z0-9/:_-]{0,12}",
            p in "[a-z0-9/:_-]{0,12}",
            t in "[a-z0-9/:_-]{0,12}",
            reversed in proptest::bool::ANY,
        ) {
            let mut tokens = vec![format!("K:{k}"), format!("P:{p}"), format!("T:{t}")];
            if reversed {
                tokens.reverse();
            }
            proptest::prop_assert_eq!(parse_identity(&tokens.join(";")).unwrap(), identity(&k, &p, &t));
        }
    }
}
