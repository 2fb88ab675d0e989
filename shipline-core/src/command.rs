use tokio::process::Command;

#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &mut Command) -> std::io::Result<std::process::Output>;
}

#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait::async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, command: &mut Command) -> std::io::Result<std::process::Output> {
        command.kill_on_drop(true).output().await
    }
}

/// Splits a configured command line into program and arguments. Single quotes keep
/// their contents verbatim, double quotes allow `\"` and `\\` escapes, and a backslash
/// outside quotes escapes the next character. `None` for a blank line or an unterminated
/// quote.
pub fn command_from_line(line: &str) -> Option<Command> {
    let words = split_command_line(line)?;
    let (program, args) = words.split_first()?;
    let mut command = Command::new(program);
    command.args(args);
    Some(command)
}

fn split_command_line(line: &str) -> Option<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next()? {
                        '\'' => break,
                        c => current.push(c),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next()? {
                        '"' => break,
                        '\\' => match chars.next()? {
                            c @ ('"' | '\\') => current.push(c),
                            c => {
                                current.push('\\');
                                current.push(c);
                            }
                        },
                        c => current.push(c),
                    }
                }
            }
            '\\' => {
                in_word = true;
                current.push(chars.next()?);
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    Some(words)
}

pub fn describe(command: &Command) -> String {
    let std_command = command.as_std();
    let mut rendered = std_command.get_program().to_string_lossy().to_string();
    for arg in std_command.get_args() {
        rendered.push(' ');
        rendered.push_str(&arg.to_string_lossy());
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoted_arguments_stay_together() {
        let command = command_from_line(r#"sh -c "curl -f http://localhost/health""#).unwrap();
        assert_eq!(describe(&command), "sh -c curl -f http://localhost/health");
        assert_eq!(command.as_std().get_args().count(), 2);

        let words = split_command_line(r#"check 'it''s fine' a\ b "say \"hi\"" """#).unwrap();
        assert_eq!(words, vec!["check", "its fine", "a b", r#"say "hi""#, ""]);
    }

    #[test]
    fn blank_or_unbalanced_lines_are_rejected() {
        assert!(command_from_line("   ").is_none());
        assert!(command_from_line(r#"sh -c "curl"#).is_none());
        assert!(command_from_line("trailing\\").is_none());
    }
}
