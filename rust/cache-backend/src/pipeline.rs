use std::time::Duration;

/// A single write queued on a [`Pipeline`].
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    Delete {
        keys: Vec<String>,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
    HSet {
        key: String,
        field: String,
        value: String,
    },
    HMSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    HDel {
        key: String,
        fields: Vec<String>,
    },
    RPush {
        key: String,
        values: Vec<String>,
    },
    ZAdd {
        key: String,
        members: Vec<(f64, String)>,
    },
}

/// Ordered batch of writes. Backends apply it atomically where they can.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pipeline {
    commands: Vec<Command>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
        ttl: Option<Duration>,
    ) -> &mut Self {
        self.commands.push(Command::Set {
            key: key.into(),
            value: value.into(),
            ttl,
        });
        self
    }

    pub fn delete(&mut self, keys: Vec<String>) -> &mut Self {
        if !keys.is_empty() {
            self.commands.push(Command::Delete { keys });
        }
        self
    }

    pub fn expire(&mut self, key: impl Into<String>, ttl: Duration) -> &mut Self {
        self.commands.push(Command::Expire {
            key: key.into(),
            ttl,
        });
        self
    }

    pub fn hset(
        &mut self,
        key: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.commands.push(Command::HSet {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn hmset(&mut self, key: impl Into<String>, fields: Vec<(String, String)>) -> &mut Self {
        if !fields.is_empty() {
            self.commands.push(Command::HMSet {
                key: key.into(),
                fields,
            });
        }
        self
    }

    pub fn hdel(&mut self, key: impl Into<String>, fields: Vec<String>) -> &mut Self {
        if !fields.is_empty() {
            self.commands.push(Command::HDel {
                key: key.into(),
                fields,
            });
        }
        self
    }

    pub fn rpush(&mut self, key: impl Into<String>, values: Vec<String>) -> &mut Self {
        if !values.is_empty() {
            self.commands.push(Command::RPush {
                key: key.into(),
                values,
            });
        }
        self
    }

    pub fn zadd(&mut self, key: impl Into<String>, members: Vec<(f64, String)>) -> &mut Self {
        if !members.is_empty() {
            self.commands.push(Command::ZAdd {
                key: key.into(),
                members,
            });
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }
}
