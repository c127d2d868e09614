//! Interpretation of chat bodies sent by a registered client.
//!
//! Plain text is relayed to everyone else. A body starting with `/` is a
//! command: `/w <user> <text>` whispers to one user and `/a` shows the banner
//! to the whole room. Malformed or unknown commands are dropped without any
//! reply to the sender.

/// Body that ends the session.
pub const LEAVE: &str = "Bye";

/// Decorative payload broadcast by the `/a` command.
pub const BANNER: &str = "
 ⠀⠀⠀⠀⠀⠀⠀⠀⠀⠀⣠⣤⣤⣤⣤⣤⣶⣦⣤⣄⡀⠀⠀⠀⠀⠀⠀⠀
⠀⠀⠀⠀⠀⠀⠀⠀⢀⣴⣿⡿⠛⠉⠙⠛⠛⠛⠛⠻⢿⣿⣷⣤⡀⠀⠀⠀⠀⠀
⠀⠀⠀⠀⠀⠀⠀⠀⣼⣿⠋⠀⠀⠀⠀⠀⠀⠀⢀⣀⣀⠈⢻⣿⣿⡄⠀⠀⠀⠀
⠀⠀⠀⠀⠀⠀⠀⣸⣿⡏⠀⠀⠀⣠⣶⣾⣿⣿⣿⠿⠿⠿⢿⣿⣿⣿⣄⠀⠀⠀
⠀⠀⠀⠀⠀⠀⠀⣿⣿⠁⠀⠀⢰⣿⣿⣯⠁⠀⠀⠀⠀⠀⠀⠀⠈⠙⢿⣷⡄⠀
⠀⠀⣀⣤⣴⣶⣶⣿⡟⠀⠀⠀⢸⣿⣿⣿⣆⠀⠀⠀⠀⠀⠀⠀⠀⠀⠀⣿⣷⠀
⠀⢰⣿⡟⠋⠉⣹⣿⡇⠀⠀⠀⠘⣿⣿⣿⣿⣷⣦⣤⣤⣤⣶⣶⣶⣶⣿⣿⣿⠀
⠀⢸⣿⡇⠀⠀⣿⣿⡇⠀⠀⠀⠀⠹⣿⣿⣿⣿⣿⣿⣿⣿⣿⣿⣿⣿⣿⡿⠃⠀
⠀⣸⣿⡇⠀⠀⣿⣿⡇⠀⠀⠀⠀⠀⠉⠻⠿⣿⣿⣿⣿⡿⠿⠿⠛⢻⣿⡇⠀⠀
⠀⣿⣿⠁⠀⠀⣿⣿⡇⠀⠀⠀⠀⠀⠀⠀⠀⠀⠀⠀⠀⠀⠀⠀⠀⢸⣿⣧⠀⠀
⠀⣿⣿⠀⠀⠀⣿⣿⡇⠀⠀⠀⠀⠀⠀⠀⠀⠀⠀⠀⠀⠀⠀⠀⠀⢸⣿⣿⠀⠀
⠀⣿⣿⠀⠀⠀⣿⣿⡇⠀⠀⠀⠀⠀⠀⠀⠀⠀⠀⠀⠀⠀⠀⠀⠀⢸⣿⣿⠀⠀
⠀⢿⣿⡆⠀⠀⣿⣿⡇⠀⠀⠀⠀⠀⠀⠀⠀⠀⠀⠀⠀⠀⠀⠀⠀⢸⣿⡇⠀⠀
⠀⠸⣿⣧⡀⠀⣿⣿⡇⠀⠀⠀⠀⠀⠀⠀⠀⠀⠀⠀⠀⠀⠀⠀⠀⣿⣿⠃⠀⠀
⠀⠀⠛⢿⣿⣿⣿⣿⣇⠀⠀⠀⠀⠀⣰⣿⣿⣷⣶⣶⣶⣶⠶⠀⢠⣿⣿⠀⠀⠀
⠀⠀⠀⠀⠀⠀⠀⣿⣿⠀⠀⠀⠀⠀⣿⣿⡇⠀⣽⣿⡏⠁⠀⠀⢸⣿⡇⠀⠀⠀
⠀⠀⠀⠀⠀⠀⠀⣿⣿⠀⠀⠀⠀⠀⣿⣿⡇⠀⢹⣿⡆⠀⠀⠀⣸⣿⠇⠀⠀⠀
⠀⠀⠀⠀⠀⠀⠀⢿⣿⣦⣄⣀⣠⣴⣿⣿⠁⠀⠈⠻⣿⣿⣿⣿⡿⠏⠀⠀⠀⠀
⠀⠀⠀⠀⠀⠀⠀⠈⠛⠻⠿⠿⠿⠿⠋⠁⠀⠀⠀⠀⠀⠀⠀⠀⠀⠀⠀⠀⠀⠀
";

/// What the relay should do with one chat body.
#[derive(Debug, PartialEq, Eq)]
pub enum Directive<'a> {
    /// End the session.
    Leave,
    /// Deliver `text` to `target` only.
    Whisper { target: &'a str, text: &'a str },
    /// Broadcast [`BANNER`] to everyone, sender included.
    Banner,
    /// Relay the body to everyone except the sender.
    Say,
    /// Drop silently.
    Ignore,
}

impl<'a> Directive<'a> {
    pub fn parse(body: &'a str) -> Self {
        if body == LEAVE {
            return Directive::Leave;
        }

        let Some(command) = body.strip_prefix('/') else {
            return Directive::Say;
        };

        let mut chars = command.chars();
        match chars.next() {
            Some('w') => parse_whisper(chars.as_str()),
            Some('a') => Directive::Banner,
            _ => Directive::Ignore,
        }
    }
}

/// `after_w` is everything following `/w`. The character in the separator
/// position is skipped whatever it is; the target runs from there up to the
/// next space and the text is everything after that single space.
fn parse_whisper(after_w: &str) -> Directive<'_> {
    let mut chars = after_w.chars();
    if chars.next().is_none() {
        return Directive::Ignore;
    }

    let args = chars.as_str();
    if args.is_empty() || args.starts_with(' ') {
        return Directive::Ignore;
    }

    match args.split_once(' ') {
        Some((target, text)) if !text.is_empty() => Directive::Whisper { target, text },
        _ => Directive::Ignore,
    }
}
