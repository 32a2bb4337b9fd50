use std::fmt;
use std::io::{self, BufRead, Write};

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};

use crate::error::IngestError;

pub const USERNAME_VAR: &str = "LORIS_USERNAME";
pub const PASSWORD_VAR: &str = "LORIS_PASSWORD";

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A source that may know the username, the password, both or neither.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialCredentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl PartialCredentials {
    fn complete(&self) -> Option<Credentials> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some(Credentials::new(user.clone(), pass.clone())),
            _ => None,
        }
    }
}

pub trait CredentialSupplier {
    /// Fills in whatever `known` is missing. Suppliers never overwrite values already present.
    fn supply(&self, known: PartialCredentials) -> Result<PartialCredentials, IngestError>;
}

pub struct EnvCredentials;

impl CredentialSupplier for EnvCredentials {
    fn supply(&self, mut known: PartialCredentials) -> Result<PartialCredentials, IngestError> {
        let read = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|value| !value.trim().is_empty())
        };
        if known.username.is_none() {
            known.username = read(USERNAME_VAR);
        }
        if known.password.is_none() {
            known.password = read(PASSWORD_VAR);
        }
        Ok(known)
    }
}

pub struct PromptCredentials;

impl CredentialSupplier for PromptCredentials {
    fn supply(&self, mut known: PartialCredentials) -> Result<PartialCredentials, IngestError> {
        if known.username.is_none() {
            let username = prompt_line("LORIS username: ")?;
            if !username.is_empty() {
                known.username = Some(username);
            }
        }
        if known.password.is_none() {
            let password = prompt_hidden("LORIS password: ")?;
            if !password.is_empty() {
                known.password = Some(password);
            }
        }
        Ok(known)
    }
}

pub struct ChainedCredentials {
    suppliers: Vec<Box<dyn CredentialSupplier>>,
}

impl ChainedCredentials {
    pub fn new(suppliers: Vec<Box<dyn CredentialSupplier>>) -> Self {
        Self { suppliers }
    }

    /// Environment first, then the terminal when `interactive` is set.
    pub fn standard(interactive: bool) -> Self {
        let mut suppliers: Vec<Box<dyn CredentialSupplier>> = vec![Box::new(EnvCredentials)];
        if interactive {
            suppliers.push(Box::new(PromptCredentials));
        }
        Self::new(suppliers)
    }

    pub fn resolve(&self) -> Result<Credentials, IngestError> {
        let mut known = PartialCredentials::default();
        for supplier in &self.suppliers {
            if known.complete().is_some() {
                break;
            }
            known = supplier.supply(known)?;
        }
        known.complete().ok_or_else(|| {
            let missing = match (&known.username, &known.password) {
                (None, None) => "username and password",
                (None, Some(_)) => "username",
                _ => "password",
            };
            IngestError::MissingCredentials(format!(
                "{missing} not provided (set {USERNAME_VAR} / {PASSWORD_VAR})"
            ))
        })
    }
}

fn prompt_line(label: &str) -> Result<String, IngestError> {
    let mut stderr = io::stderr();
    write!(stderr, "{label}").map_err(|err| IngestError::MissingCredentials(err.to_string()))?;
    stderr
        .flush()
        .map_err(|err| IngestError::MissingCredentials(err.to_string()))?;
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|err| IngestError::MissingCredentials(err.to_string()))?;
    Ok(line.trim().to_string())
}

fn prompt_hidden(label: &str) -> Result<String, IngestError> {
    let mut stderr = io::stderr();
    write!(stderr, "{label}").map_err(|err| IngestError::MissingCredentials(err.to_string()))?;
    stderr
        .flush()
        .map_err(|err| IngestError::MissingCredentials(err.to_string()))?;

    enable_raw_mode().map_err(|err| IngestError::MissingCredentials(err.to_string()))?;
    let result = read_hidden();
    disable_raw_mode().map_err(|err| IngestError::MissingCredentials(err.to_string()))?;
    let _ = writeln!(stderr);
    result
}

fn read_hidden() -> Result<String, IngestError> {
    let mut value = String::new();
    loop {
        let event = event::read().map_err(|err| IngestError::MissingCredentials(err.to_string()))?;
        let Event::Key(KeyEvent {
            code,
            modifiers,
            kind,
            ..
        }) = event
        else {
            continue;
        };
        if kind != KeyEventKind::Press {
            continue;
        }
        match code {
            KeyCode::Enter => return Ok(value),
            KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => {
                return Err(IngestError::MissingCredentials(
                    "password prompt interrupted".to_string(),
                ));
            }
            KeyCode::Char(ch) => value.push(ch),
            KeyCode::Backspace => {
                value.pop();
            }
            KeyCode::Esc => {
                return Err(IngestError::MissingCredentials(
                    "password prompt cancelled".to_string(),
                ));
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(PartialCredentials);

    impl CredentialSupplier for Fixed {
        fn supply(&self, mut known: PartialCredentials) -> Result<PartialCredentials, IngestError> {
            known.username = known.username.or_else(|| self.0.username.clone());
            known.password = known.password.or_else(|| self.0.password.clone());
            Ok(known)
        }
    }

    #[test]
    fn chain_fills_missing_parts_in_order() {
        let chain = ChainedCredentials::new(vec![
            Box::new(Fixed(PartialCredentials {
                username: Some("admin".to_string()),
                password: None,
            })),
            Box::new(Fixed(PartialCredentials {
                username: Some("ignored".to_string()),
                password: Some("secret".to_string()),
            })),
        ]);
        let creds = chain.resolve().unwrap();
        assert_eq!(creds.username, "admin");
        assert_eq!(creds.password(), "secret");
        assert!(!format!("{creds:?}").contains("secret"));
    }
}
