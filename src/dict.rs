//! Line-oriented dictionary loader.
//!
//! The accepted format is the AFL one: `name="value"` per line, where the
//! value may contain `\\`, `\"` and `\xNN` escapes. Empty lines and lines
//! starting with `#` are skipped. Malformed entries are reported through the
//! caller's callback and skipped; they never abort the load.

use std::fs;
use std::path::Path;

use libafl_bolts::Error;

/// Load the dictionary at `path`, appending each token to `dict`.
///
/// With `check_unique` set, tokens already present in `dict` are dropped.
pub fn load<F>(
    path: &Path,
    dict: &mut Vec<Vec<u8>>,
    check_unique: bool,
    report: &mut F,
) -> Result<(), Error>
where
    F: FnMut(String),
{
    let text = fs::read_to_string(path)?;

    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some(eq) = line.find('=') else {
            report(format!("{}:{}: missing '='", path.display(), lineno + 1));
            continue;
        };
        let value = line[eq + 1..].trim();
        if value.len() < 2 || !value.starts_with('"') || !value.ends_with('"') {
            report(format!(
                "{}:{}: value is not a quoted string",
                path.display(),
                lineno + 1
            ));
            continue;
        }

        match unescape(&value[1..value.len() - 1]) {
            Ok(token) if token.is_empty() => {
                report(format!("{}:{}: empty token", path.display(), lineno + 1));
            }
            Ok(token) => {
                if !check_unique || !dict.contains(&token) {
                    dict.push(token);
                }
            }
            Err(msg) => {
                report(format!("{}:{}: {}", path.display(), lineno + 1, msg));
            }
        }
    }

    Ok(())
}

fn unescape(s: &str) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(s.len());
    let mut chars = s.bytes();

    while let Some(b) = chars.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match chars.next() {
            Some(b'\\') => out.push(b'\\'),
            Some(b'"') => out.push(b'"'),
            Some(b'x') => {
                let hi = chars.next().ok_or("truncated \\x escape")?;
                let lo = chars.next().ok_or("truncated \\x escape")?;
                let hex = [hi, lo];
                let hex = std::str::from_utf8(&hex).map_err(|_| "bad \\x escape")?;
                let v = u8::from_str_radix(hex, 16).map_err(|_| "bad \\x escape")?;
                out.push(v);
            }
            other => return Err(format!("unsupported escape: {other:?}")),
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::load;

    #[test]
    fn loads_tokens_and_reports_malformed() {
        let path = std::env::temp_dir().join(format!("tarsier-dict-{}", std::process::id()));
        std::fs::write(
            &path,
            b"# comment\nkw1=\"SELECT\"\nkw2=\"\\x00\\x01\"\nbroken\nkw3=\"a\\\"b\"\n",
        )
        .unwrap();

        let mut dict = Vec::new();
        let mut errors = Vec::new();
        load(&path, &mut dict, false, &mut |m| errors.push(m)).unwrap();

        assert_eq!(
            dict,
            vec![b"SELECT".to_vec(), vec![0x00, 0x01], b"a\"b".to_vec()]
        );
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("missing '='"));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn unique_check_drops_duplicates() {
        let path = std::env::temp_dir().join(format!("tarsier-dict2-{}", std::process::id()));
        std::fs::write(&path, b"a=\"x\"\nb=\"x\"\nc=\"y\"\n").unwrap();

        let mut dict = Vec::new();
        load(&path, &mut dict, true, &mut |_| ()).unwrap();
        assert_eq!(dict, vec![b"x".to_vec(), b"y".to_vec()]);
        std::fs::remove_file(&path).unwrap();
    }
}
