use crate::error::SignatureError;
use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

/// Arity above this is treated as line noise, not a real command.
const MAX_ARITY: usize = 64;

/// One command as announced by firmware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandDescriptor {
    pub name: String,
    pub input_arity: usize,
    pub output_arity: usize,
    /// Raw signature as received, kept for display.
    pub signature: String,
}

impl CommandDescriptor {
    /// Sent as a bare name with nothing read back.
    pub fn is_bare(&self) -> bool {
        self.input_arity == 0 && self.output_arity == 0
    }

    pub fn is_read_only(&self) -> bool {
        self.input_arity == 0 && self.output_arity > 0
    }
}

fn signature_regex() -> Option<&'static Regex> {
    static SIGNATURE: OnceLock<Option<Regex>> = OnceLock::new();
    SIGNATURE
        .get_or_init(|| Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)(?:>(\d+))?(?:<(\d+))?$").ok())
        .as_ref()
}

/// Parse `name[>N][<M]`: N output lines, M input lines, both defaulting to 0.
pub fn parse_signature(raw: &str) -> Result<CommandDescriptor, SignatureError> {
    let sig = raw.trim();
    if sig.is_empty() {
        return Err(SignatureError::Empty);
    }
    let caps = signature_regex()
        .and_then(|re| re.captures(sig))
        .ok_or_else(|| SignatureError::Malformed(sig.to_string()))?;
    let arity = |idx: usize| -> Result<usize, SignatureError> {
        match caps.get(idx) {
            None => Ok(0),
            Some(m) => m
                .as_str()
                .parse::<usize>()
                .ok()
                .filter(|n| *n <= MAX_ARITY)
                .ok_or_else(|| SignatureError::ArityOverflow(sig.to_string())),
        }
    };
    Ok(CommandDescriptor {
        name: caps[1].to_string(),
        output_arity: arity(2)?,
        input_arity: arity(3)?,
        signature: sig.to_string(),
    })
}

/// A device's commands in the order they were announced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CommandCatalog {
    commands: Vec<CommandDescriptor>,
}

impl CommandCatalog {
    /// Parse a fixed list of signatures (seeded catalogs).
    pub fn from_signatures<I, S>(signatures: I) -> Result<Self, SignatureError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut catalog = Self::default();
        for sig in signatures {
            catalog.insert(parse_signature(sig.as_ref())?);
        }
        Ok(catalog)
    }

    /// Insert, replacing an earlier command of the same name.
    pub fn insert(&mut self, desc: CommandDescriptor) {
        match self.commands.iter_mut().find(|c| c.name == desc.name) {
            Some(existing) => *existing = desc,
            None => self.commands.push(desc),
        }
    }

    pub fn get(&self, name: &str) -> Option<&CommandDescriptor> {
        self.commands.iter().find(|c| c.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommandDescriptor> {
        self.commands.iter()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
