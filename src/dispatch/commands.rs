/// Slash commands understood by the bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    List,
    /// `/add name|prompt|kw1,kw2`
    Add(String),
    /// `/talk` or `/talk name|message`
    Talk(String),
    /// `/clear name`
    Clear(String),
    Unknown(String),
}

/// Button payload prefix for interactive persona selection.
pub const SELECT_PERSONA_PREFIX: &str = "select_persona:";

pub const HELP_TEXT: &str = "/list - show personas\n\
/add name|prompt|kw1,kw2 - add a persona\n\
/talk name|message - talk to a persona\n\
/talk - pick a persona from a list\n\
/clear name - clear a persona's memory\n\
You can also write \"Name: message\" or mention the bot with @handle";

impl Command {
    /// Parse a message starting with `/`. A `@handle` suffix on the command
    /// word (`/list@my_bot`) is accepted and ignored.
    pub fn parse(text: &str) -> Option<Self> {
        let rest = text.trim_start().strip_prefix('/')?;
        let (word, payload) = match rest.find(char::is_whitespace) {
            Some(idx) => (&rest[..idx], rest[idx..].trim()),
            None => (rest, ""),
        };
        let word = word.split('@').next().unwrap_or_default().to_lowercase();
        let payload = payload.to_string();

        Some(match word.as_str() {
            "start" => Command::Start,
            "help" => Command::Help,
            "list" => Command::List,
            "add" => Command::Add(payload),
            "talk" => Command::Talk(payload),
            "clear" => Command::Clear(payload),
            _ => Command::Unknown(word),
        })
    }
}

/// Arguments of `/add`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddArgs {
    pub name: String,
    pub prompt: String,
    pub keywords: Vec<String>,
}

/// Parse `name|prompt|kw1,kw2`. Keywords are optional.
pub fn parse_add(payload: &str) -> Option<AddArgs> {
    let mut parts = payload.split('|').map(str::trim);
    let name = parts.next().filter(|s| !s.is_empty())?;
    let prompt = parts.next().filter(|s| !s.is_empty())?;
    let keywords = parts
        .next()
        .map(|kws| {
            kws.split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    Some(AddArgs {
        name: name.to_string(),
        prompt: prompt.to_string(),
        keywords,
    })
}

/// Parse `name|message`. Everything after the first `|` is the message.
pub fn parse_talk(payload: &str) -> Option<(String, String)> {
    let (name, message) = payload.split_once('|')?;
    let (name, message) = (name.trim(), message.trim());
    if name.is_empty() || message.is_empty() {
        return None;
    }
    Some((name.to_string(), message.to_string()))
}
