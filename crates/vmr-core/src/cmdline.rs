//! Argument splitting for Windows command lines.

/// Splits `arguments` the way a Windows command line is read: whitespace
/// separates arguments, double quotes group them and are dropped, and
/// backslashes are kept literally. An unbalanced quote runs to the end.
pub fn split_windows_args(arguments: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;

    for ch in arguments.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            ch if ch.is_whitespace() && !in_quotes => {
                if has_token {
                    args.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            ch => {
                current.push(ch);
                has_token = true;
            }
        }
    }
    if has_token {
        args.push(current);
    }
    args
}
