//! Shared helpers.

/// Environment variable name fragments whose values must never be logged.
const SENSITIVE_KEYS: &[&str] = &[
    "TOKEN",
    "SECRET",
    "PASSWORD",
    "PASSWD",
    "PASS",
    "API_KEY",
    "PRIVATE_KEY",
    "ACCESS_KEY",
    "CREDENTIAL",
];

/// Flags whose argument must never be logged.
const SENSITIVE_FLAGS: &[&str] = &["--token", "--password", "--api-key", "--secret"];

const MASK: &str = "***";

/// Mask secret values in a command line before it is logged.
///
/// `KEY=value` assignments whose key looks like a credential and the argument
/// of well-known secret flags (`--token x` or `--token=x`) are replaced by
/// `***`. Spacing of the original command is preserved.
pub fn mask_sensitive_command(cmd: &str) -> String {
    let mut masked = Vec::new();
    let mut mask_next = false;

    for token in cmd.split(' ') {
        if token.is_empty() {
            masked.push(String::new());
            continue;
        }
        if mask_next {
            masked.push(MASK.to_string());
            mask_next = false;
            continue;
        }
        if SENSITIVE_FLAGS.contains(&token) {
            mask_next = true;
            masked.push(token.to_string());
            continue;
        }
        masked.push(mask_token(token));
    }

    masked.join(" ")
}

fn mask_token(token: &str) -> String {
    let Some((key, _)) = token.split_once('=') else {
        return token.to_string();
    };

    if SENSITIVE_FLAGS.contains(&key) || is_sensitive_key(key) {
        return format!("{key}={MASK}");
    }
    token.to_string()
}

fn is_sensitive_key(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    !upper.is_empty()
        && upper
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && SENSITIVE_KEYS.iter().any(|k| upper.contains(k))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_env_assignments() {
        assert_eq!(
            mask_sensitive_command("GITHUB_TOKEN=abc123 ./runtest -f syscalls"),
            "GITHUB_TOKEN=*** ./runtest -f syscalls"
        );
        assert_eq!(
            mask_sensitive_command("DB_PASSWORD=hunter2 api_key=xyz make"),
            "DB_PASSWORD=*** api_key=*** make"
        );
    }

    #[test]
    fn masks_flag_arguments() {
        assert_eq!(
            mask_sensitive_command("client --token abc --verbose"),
            "client --token *** --verbose"
        );
        assert_eq!(
            mask_sensitive_command("client --password=abc"),
            "client --password=***"
        );
    }

    #[test]
    fn leaves_ordinary_commands_alone() {
        let cmd = "LTPROOT=/opt/ltp  mmap01 -i 10 --path=/tmp";
        assert_eq!(mask_sensitive_command(cmd), cmd);
        assert_eq!(mask_sensitive_command(""), "");
    }
}
