//! Account storage seam.
//!
//! The real account database lives outside this server; login and game
//! handlers only see the [`AccountStore`] trait. [`MemoryAccountStore`] is
//! the built-in implementation, seeded from the config file.

use crate::config::AccountSeed;
use log::{debug, info};
use parking_lot::Mutex;
use rand::Rng;
use shared::ErrorCode;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Token handed out at login and presented to the game service.
pub type SessionToken = u64;

const MIN_NAME_LENGTH: usize = 3;
const MAX_NAME_LENGTH: usize = 30;
const MIN_PASSWORD_LENGTH: usize = 4;
const MAX_PASSWORD_LENGTH: usize = 64;

pub trait AccountStore: Send + Sync {
    /// Checks a name and password pair.
    fn authenticate(&self, account: &str, password: &str) -> bool;

    fn create_account(&self, account: &str, password: &str, email: &str) -> Result<(), ErrorCode>;

    /// Character names owned by `account`, empty for unknown accounts.
    fn characters(&self, account: &str) -> Vec<String>;

    /// Issues a fresh session token for an authenticated account.
    fn issue_token(&self, account: &str) -> SessionToken;

    /// Whether `token` was issued to `account` and has not expired.
    fn validate_token(&self, account: &str, token: SessionToken) -> bool;
}

struct Account {
    password: String,
    email: String,
    characters: Vec<String>,
}

struct Session {
    account: String,
    expires: Instant,
}

#[derive(Default)]
struct Accounts {
    accounts: HashMap<String, Account>,
    sessions: HashMap<SessionToken, Session>,
}

pub struct MemoryAccountStore {
    token_lifetime: Duration,
    inner: Mutex<Accounts>,
}

fn valid_name(name: &str) -> bool {
    (MIN_NAME_LENGTH..=MAX_NAME_LENGTH).contains(&name.len())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn valid_password(password: &str) -> bool {
    (MIN_PASSWORD_LENGTH..=MAX_PASSWORD_LENGTH).contains(&password.len())
}

/// Default character name for a new account: the account name, capitalised.
fn character_name(account: &str) -> String {
    let mut chars = account.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

impl MemoryAccountStore {
    pub fn new(token_lifetime: Duration) -> Self {
        Self {
            token_lifetime,
            inner: Mutex::new(Accounts::default()),
        }
    }

    /// Builds a store holding the given accounts.
    pub fn with_accounts(token_lifetime: Duration, seeds: &[AccountSeed]) -> Self {
        let store = Self::new(token_lifetime);
        {
            let mut inner = store.inner.lock();
            for seed in seeds {
                inner.accounts.insert(
                    seed.name.to_lowercase(),
                    Account {
                        password: seed.password.clone(),
                        email: String::new(),
                        characters: seed.characters.clone(),
                    },
                );
            }
        }
        if !seeds.is_empty() {
            info!("Loaded {} accounts", seeds.len());
        }
        store
    }

    pub fn len(&self) -> usize {
        self.inner.lock().accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Email recorded for `account`, if any.
    pub fn email(&self, account: &str) -> Option<String> {
        self.inner
            .lock()
            .accounts
            .get(&account.to_lowercase())
            .map(|account| account.email.clone())
    }
}

impl AccountStore for MemoryAccountStore {
    fn authenticate(&self, account: &str, password: &str) -> bool {
        self.inner
            .lock()
            .accounts
            .get(&account.to_lowercase())
            .map_or(false, |stored| stored.password == password)
    }

    fn create_account(&self, account: &str, password: &str, email: &str) -> Result<(), ErrorCode> {
        if !valid_name(account) || !valid_password(password) {
            return Err(ErrorCode::InvalidAccountData);
        }

        let key = account.to_lowercase();
        let character = character_name(account);
        let mut inner = self.inner.lock();
        if inner.accounts.contains_key(&key) {
            return Err(ErrorCode::AccountExists);
        }
        let taken = inner
            .accounts
            .values()
            .any(|other| other.characters.iter().any(|name| name.eq_ignore_ascii_case(&character)));
        if taken {
            return Err(ErrorCode::AccountExists);
        }

        inner.accounts.insert(
            key,
            Account {
                password: password.to_string(),
                email: email.to_string(),
                characters: vec![character],
            },
        );
        info!("Created account {}", account);
        Ok(())
    }

    fn characters(&self, account: &str) -> Vec<String> {
        self.inner
            .lock()
            .accounts
            .get(&account.to_lowercase())
            .map(|account| account.characters.clone())
            .unwrap_or_default()
    }

    fn issue_token(&self, account: &str) -> SessionToken {
        let now = Instant::now();
        let mut rng = rand::thread_rng();
        let mut inner = self.inner.lock();
        inner.sessions.retain(|_, session| session.expires > now);

        let token = loop {
            let candidate: SessionToken = rng.gen();
            if candidate != 0 && !inner.sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        inner.sessions.insert(
            token,
            Session {
                account: account.to_lowercase(),
                expires: now + self.token_lifetime,
            },
        );
        debug!("Issued session token for {}", account);
        token
    }

    fn validate_token(&self, account: &str, token: SessionToken) -> bool {
        let inner = self.inner.lock();
        inner.sessions.get(&token).map_or(false, |session| {
            session.account == account.to_lowercase() && session.expires > Instant::now()
        })
    }
}
