//! Command-line tokenizing for reliable and out-of-band commands.

/// Split a command line into arguments.
///
/// Whitespace separates arguments; a double-quoted span is one argument
/// with the quotes removed. An unterminated quote runs to the end.
pub fn tokenize(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        let Some(&first) = chars.peek() else {
            break;
        };

        let mut arg = String::new();
        if first == '"' {
            chars.next();
            for c in chars.by_ref() {
                if c == '"' {
                    break;
                }
                arg.push(c);
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                arg.push(c);
                chars.next();
            }
        }
        args.push(arg);
    }
    args
}

/// Everything after the first argument, untokenized.
pub fn args_after_first(line: &str) -> &str {
    let line = line.trim_start();
    match line.find(char::is_whitespace) {
        Some(i) => line[i..].trim_start(),
        None => "",
    }
}

/// Quote an argument so [`tokenize`] returns it intact. Embedded quotes
/// cannot be represented and become single quotes.
pub fn quote(arg: &str) -> String {
    format!("\"{}\"", arg.replace('"', "'"))
}
