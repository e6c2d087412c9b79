//! Line commands understood by the terminal chat client.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    /// Plain text to send.
    Say(String),
    /// `/image <url> [caption]`
    Image { url: String, caption: String },
    /// `/edit <n> <text>`, `n` counting from 1 as shown by `/history`.
    Edit { index: usize, content: String },
    Retry,
    History,
    Clear,
    Help,
    Quit,
    Empty,
}

pub const HELP: &str = "\
/image <url> [text]  send an image with an optional caption
/edit <n> <text>     rewrite message n and regenerate from there
/retry               resend after a failed reply
/history             show the conversation
/clear               delete the conversation
/quit                leave";

pub fn parse_command(line: &str) -> Result<ReplCommand, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(ReplCommand::Empty);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(ReplCommand::Say(line.to_string()));
    };

    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (rest, ""),
    };

    match name {
        "quit" | "exit" | "q" => Ok(ReplCommand::Quit),
        "clear" => Ok(ReplCommand::Clear),
        "retry" => Ok(ReplCommand::Retry),
        "history" => Ok(ReplCommand::History),
        "help" | "?" => Ok(ReplCommand::Help),
        "image" => {
            let (url, caption) = args.split_once(char::is_whitespace).unwrap_or((args, ""));
            if url.is_empty() {
                return Err("usage: /image <url> [text]".to_string());
            }
            Ok(ReplCommand::Image { url: url.to_string(), caption: caption.trim().to_string() })
        }
        "edit" => {
            let (n, content) = args
                .split_once(char::is_whitespace)
                .ok_or_else(|| "usage: /edit <n> <text>".to_string())?;
            let n: usize = n.parse().map_err(|_| format!("not a message number: {n}"))?;
            if n == 0 {
                return Err("messages are numbered from 1".to_string());
            }
            Ok(ReplCommand::Edit { index: n - 1, content: content.trim().to_string() })
        }
        other => Err(format!("unknown command /{other}, try /help")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("/quit", ReplCommand::Quit)]
    #[case("/exit", ReplCommand::Quit)]
    #[case("/clear", ReplCommand::Clear)]
    #[case("/retry", ReplCommand::Retry)]
    #[case("/history", ReplCommand::History)]
    #[case("/help", ReplCommand::Help)]
    #[case("   ", ReplCommand::Empty)]
    fn test_simple_commands(#[case] line: &str, #[case] expected: ReplCommand) {
        assert_eq!(parse_command(line).unwrap(), expected);
    }

    #[test]
    fn test_plain_text_is_said() {
        assert_eq!(parse_command("  hello there ").unwrap(), ReplCommand::Say("hello there".into()));
    }

    #[test]
    fn test_image_with_caption() {
        assert_eq!(
            parse_command("/image https://i/x.png what is this").unwrap(),
            ReplCommand::Image { url: "https://i/x.png".into(), caption: "what is this".into() }
        );
    }

    #[test]
    fn test_image_without_caption() {
        assert_eq!(
            parse_command("/image https://i/x.png").unwrap(),
            ReplCommand::Image { url: "https://i/x.png".into(), caption: String::new() }
        );
        assert!(parse_command("/image").is_err());
    }

    #[test]
    fn test_edit_is_one_based() {
        assert_eq!(
            parse_command("/edit 3 new words here").unwrap(),
            ReplCommand::Edit { index: 2, content: "new words here".into() }
        );
    }

    #[rstest]
    #[case("/edit")]
    #[case("/edit 2")]
    #[case("/edit x text")]
    #[case("/edit 0 text")]
    #[case("/dance")]
    fn test_bad_commands(#[case] line: &str) {
        assert!(parse_command(line).is_err());
    }
}
