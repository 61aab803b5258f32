#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
}

/// Commands whose whole remainder is one setting value.
pub(crate) const SETTING_COMMANDS: &[(CommandSpec, &str)] = &[
    (
        CommandSpec {
            command: "persona",
            action: "set_persona",
        },
        "persona",
    ),
    (
        CommandSpec {
            command: "hint",
            action: "set_post_type",
        },
        "post_type",
    ),
    (
        CommandSpec {
            command: "text_model",
            action: "set_text_model",
        },
        "text_model",
    ),
    (
        CommandSpec {
            command: "image_model",
            action: "set_image_model",
        },
        "image_model",
    ),
];

/// Commands taking a 1-based sub-task number followed by shell-style words.
pub(crate) const INDEXED_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "queries",
        action: "set_queries",
    },
    CommandSpec {
        command: "rename",
        action: "rename_sub_task",
    },
    CommandSpec {
        command: "retry",
        action: "retry_sub_task",
    },
];

/// Commands taking a list of shell-style words.
pub(crate) const WORD_LIST_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "select",
        action: "select",
    },
    CommandSpec {
        command: "unselect",
        action: "unselect",
    },
    CommandSpec {
        command: "drop",
        action: "drop_sub_task",
    },
    CommandSpec {
        command: "add",
        action: "add_sub_task",
    },
];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "help",
        action: "help",
    },
    CommandSpec {
        command: "status",
        action: "status",
    },
    CommandSpec {
        command: "plan",
        action: "show_plan",
    },
    CommandSpec {
        command: "results",
        action: "show_results",
    },
    CommandSpec {
        command: "approve",
        action: "approve_plan",
    },
    CommandSpec {
        command: "generate",
        action: "generate",
    },
    CommandSpec {
        command: "delete",
        action: "delete",
    },
    CommandSpec {
        command: "quit",
        action: "quit",
    },
];

pub(crate) const ANIMATE_COMMAND: CommandSpec = CommandSpec {
    command: "animate",
    action: "animate",
};

pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "/persona",
    "/hint",
    "/text_model",
    "/image_model",
    "/plan",
    "/queries",
    "/rename",
    "/add",
    "/drop",
    "/approve",
    "/results",
    "/retry",
    "/select",
    "/unselect",
    "/generate",
    "/animate",
    "/status",
    "/delete",
    "/quit",
];
