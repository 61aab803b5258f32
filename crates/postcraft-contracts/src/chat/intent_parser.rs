use std::collections::BTreeMap;

use serde_json::Value;

use super::command_registry::{
    CommandSpec, ANIMATE_COMMAND, INDEXED_COMMANDS, NO_ARG_COMMANDS, SETTING_COMMANDS,
    WORD_LIST_COMMANDS,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub action: String,
    pub raw: String,
    pub prompt: Option<String>,
    pub settings_update: BTreeMap<String, Value>,
    pub command_args: BTreeMap<String, Value>,
}

impl Intent {
    fn new(action: &str, raw: &str) -> Self {
        Self {
            action: action.to_string(),
            raw: raw.to_string(),
            prompt: None,
            settings_update: BTreeMap::new(),
            command_args: BTreeMap::new(),
        }
    }

    fn invalid(raw: &str, command: &str, message: String) -> Self {
        let mut intent = Self::new("invalid", raw);
        intent
            .command_args
            .insert("command".to_string(), Value::String(command.to_string()));
        intent
            .command_args
            .insert("error".to_string(), Value::String(message));
        intent
    }

    pub fn words(&self) -> Vec<String> {
        self.command_args
            .get("words")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Zero-based sub-task position for indexed commands.
    pub fn position(&self) -> Option<usize> {
        self.command_args
            .get("index")
            .and_then(Value::as_u64)
            .and_then(|index| usize::try_from(index).ok())
            .and_then(|index| index.checked_sub(1))
    }
}

fn find_action(command: &str, specs: &[CommandSpec]) -> Option<&'static str> {
    specs
        .iter()
        .find(|spec| spec.command == command)
        .map(|spec| spec.action)
}

fn parse_words(arg: &str) -> Vec<String> {
    if arg.trim().is_empty() {
        return Vec::new();
    }
    match shell_words::split(arg) {
        Ok(parts) => parts
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect(),
        Err(_) => arg
            .split_whitespace()
            .map(str::to_string)
            .filter(|value| !value.is_empty())
            .collect(),
    }
}

fn words_value(words: Vec<String>) -> Value {
    Value::Array(words.into_iter().map(Value::String).collect())
}

pub fn parse_intent(text: &str) -> Intent {
    let raw_trimmed = text.trim();
    if raw_trimmed.is_empty() {
        return Intent::new("noop", text);
    }

    if let Some(slash_tail) = raw_trimmed.strip_prefix('/') {
        let command_len = slash_tail
            .chars()
            .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
            .count();
        if command_len > 0 {
            let command = slash_tail[..command_len].to_ascii_lowercase();
            let arg = slash_tail[command_len..].trim();

            if let Some((spec, key)) = SETTING_COMMANDS
                .iter()
                .find(|(spec, _)| spec.command == command)
            {
                let mut intent = Intent::new(spec.action, text);
                intent
                    .settings_update
                    .insert((*key).to_string(), Value::String(arg.to_string()));
                return intent;
            }

            if let Some(action) = find_action(&command, INDEXED_COMMANDS) {
                let mut words = parse_words(arg);
                if words.is_empty() {
                    return Intent::invalid(text, &command, format!("/{command} needs a sub-task number"));
                }
                let head = words.remove(0);
                let index = match head.parse::<u64>() {
                    Ok(index) if index > 0 => index,
                    _ => {
                        return Intent::invalid(
                            text,
                            &command,
                            format!("/{command}: '{head}' is not a sub-task number"),
                        )
                    }
                };
                let mut intent = Intent::new(action, text);
                intent
                    .command_args
                    .insert("index".to_string(), Value::Number(index.into()));
                intent
                    .command_args
                    .insert("words".to_string(), words_value(words));
                return intent;
            }

            if let Some(action) = find_action(&command, WORD_LIST_COMMANDS) {
                let mut intent = Intent::new(action, text);
                intent
                    .command_args
                    .insert("words".to_string(), words_value(parse_words(arg)));
                return intent;
            }

            if let Some(action) = find_action(&command, NO_ARG_COMMANDS) {
                return Intent::new(action, text);
            }

            if command == ANIMATE_COMMAND.command {
                let mut intent = Intent::new(ANIMATE_COMMAND.action, text);
                let words = parse_words(arg);
                let mut duration = Value::Null;
                let mut aspect_ratio = Value::Null;
                for word in words {
                    if let Ok(seconds) = word.parse::<u64>() {
                        duration = Value::Number(seconds.into());
                    } else if word.contains(':') {
                        aspect_ratio = Value::String(word);
                    }
                }
                intent
                    .command_args
                    .insert("duration_seconds".to_string(), duration);
                intent
                    .command_args
                    .insert("aspect_ratio".to_string(), aspect_ratio);
                return intent;
            }

            let mut intent = Intent::new("unknown", text);
            intent
                .command_args
                .insert("command".to_string(), Value::String(command));
            intent
                .command_args
                .insert("arg".to_string(), Value::String(arg.to_string()));
            return intent;
        }
    }

    let mut intent = Intent::new("start", text);
    intent.prompt = Some(raw_trimmed.to_string());
    intent
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::parse_intent;

    #[test]
    fn plain_text_starts_a_session() {
        let intent = parse_intent("  best coffee shops in Lisbon ");
        assert_eq!(intent.action, "start");
        assert_eq!(intent.prompt.as_deref(), Some("best coffee shops in Lisbon"));
    }

    #[test]
    fn blank_input_is_noop() {
        assert_eq!(parse_intent("   ").action, "noop");
    }

    #[test]
    fn parse_setting_commands() {
        let persona = parse_intent("/persona inf-42");
        assert_eq!(persona.action, "set_persona");
        assert_eq!(persona.settings_update["persona"], json!("inf-42"));

        let hint = parse_intent("/hint How-to");
        assert_eq!(hint.action, "set_post_type");
        assert_eq!(hint.settings_update["post_type"], json!("How-to"));

        let model = parse_intent("/image_model gemini-3-pro-image-preview");
        assert_eq!(model.action, "set_image_model");
        assert_eq!(
            model.settings_update["image_model"],
            json!("gemini-3-pro-image-preview")
        );
    }

    #[test]
    fn parse_indexed_commands_with_quoted_words() {
        let queries = parse_intent("/queries 2 \"latte art\" \"flat white recipe\"");
        assert_eq!(queries.action, "set_queries");
        assert_eq!(queries.position(), Some(1));
        assert_eq!(
            queries.words(),
            vec!["latte art".to_string(), "flat white recipe".to_string()]
        );

        let retry = parse_intent("/retry 1");
        assert_eq!(retry.action, "retry_sub_task");
        assert_eq!(retry.position(), Some(0));
        assert!(retry.words().is_empty());
    }

    #[test]
    fn indexed_commands_reject_bad_numbers() {
        let missing = parse_intent("/rename");
        assert_eq!(missing.action, "invalid");
        assert_eq!(missing.command_args["command"], json!("rename"));

        let zero = parse_intent("/retry 0 coffee");
        assert_eq!(zero.action, "invalid");

        let word = parse_intent("/queries two a b");
        assert_eq!(word.action, "invalid");
        assert_eq!(
            word.command_args["error"],
            json!("/queries: 'two' is not a sub-task number")
        );
    }

    #[test]
    fn parse_word_list_commands() {
        let select = parse_intent("/select w1 w3 i2");
        assert_eq!(select.action, "select");
        assert_eq!(select.words(), vec!["w1", "w3", "i2"]);

        let add = parse_intent("/add \"Local roasters\" roasters \"roastery tours\"");
        assert_eq!(add.action, "add_sub_task");
        assert_eq!(
            add.command_args["words"],
            json!(["Local roasters", "roasters", "roastery tours"])
        );
    }

    #[test]
    fn parse_no_arg_commands() {
        assert_eq!(parse_intent("/approve").action, "approve_plan");
        assert_eq!(parse_intent("/GENERATE").action, "generate");
        assert_eq!(parse_intent("/plan").action, "show_plan");
        assert_eq!(parse_intent("/quit").action, "quit");
    }

    #[test]
    fn parse_animate_arguments_in_any_order() {
        let intent = parse_intent("/animate 9:16 6");
        assert_eq!(intent.action, "animate");
        assert_eq!(intent.command_args["duration_seconds"], json!(6));
        assert_eq!(intent.command_args["aspect_ratio"], json!("9:16"));

        let bare = parse_intent("/animate");
        assert_eq!(bare.command_args["duration_seconds"], json!(null));
    }

    #[test]
    fn parse_unknown_command() {
        let intent = parse_intent("/magic foo bar");
        assert_eq!(intent.action, "unknown");
        assert_eq!(intent.command_args["command"], json!("magic"));
        assert_eq!(intent.command_args["arg"], json!("foo bar"));
    }
}
