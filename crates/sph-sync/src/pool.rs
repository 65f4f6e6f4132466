use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sph_core::Credential;
use tracing::{info, warn};

use crate::window::RateWindow;

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now = shifted(*now, by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn shifted(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|step| at.checked_add_signed(step))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, Clone)]
pub struct Account {
    pub name: String,
    pub credential: Credential,
    pub usage: u64,
    pub available_at: Option<DateTime<Utc>>,
    pub last_failure: Option<String>,
}

impl Account {
    pub fn new(name: impl Into<String>, credential: Credential) -> Self {
        Self {
            name: name.into(),
            credential,
            usage: 0,
            available_at: None,
            last_failure: None,
        }
    }

    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.available_at.map_or(true, |deadline| now >= deadline)
    }

    fn is_usable(&self, now: DateTime<Utc>, quota: u64) -> bool {
        self.is_available(now) && self.usage < quota && !self.credential.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountHandle {
    pub index: usize,
    pub name: String,
    pub credential: Credential,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AccountSnapshot {
    pub name: String,
    pub usage: u64,
    pub available_at: Option<DateTime<Utc>>,
    pub last_failure: Option<String>,
    pub has_credentials: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_requests_per_window: u64,
    pub window: Option<Duration>,
}

#[derive(Debug)]
struct PoolState {
    accounts: Vec<Account>,
    cursor: Option<usize>,
}

fn lock(state: &Mutex<PoolState>) -> MutexGuard<'_, PoolState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct CredentialPool {
    state: Arc<Mutex<PoolState>>,
    clock: Arc<dyn Clock>,
    quota: u64,
    window: Option<RateWindow>,
}

impl CredentialPool {
    pub fn new(accounts: Vec<Account>, settings: PoolSettings, clock: Arc<dyn Clock>) -> Self {
        let state = Arc::new(Mutex::new(PoolState {
            accounts,
            cursor: None,
        }));
        let window = settings.window.map(|period| {
            let shared = Arc::clone(&state);
            RateWindow::spawn(period, move || {
                let mut guard = lock(&shared);
                for account in guard.accounts.iter_mut() {
                    account.usage = 0;
                }
            })
        });
        Self {
            state,
            clock,
            quota: settings.max_requests_per_window,
            window,
        }
    }

    pub fn from_credentials(
        credentials: Vec<(String, Credential)>,
        settings: PoolSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let accounts = credentials
            .into_iter()
            .map(|(name, credential)| Account::new(name, credential))
            .collect();
        Self::new(accounts, settings, clock)
    }

    pub fn len(&self) -> usize {
        lock(&self.state).accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Next usable account after the last one handed out, wrapping around.
    ///
    /// `None` means every account is backed off, over quota or lacks
    /// credentials. The cursor only moves on a successful pick.
    pub fn next(&self) -> Option<AccountHandle> {
        let now = self.clock.now();
        let mut guard = lock(&self.state);
        let count = guard.accounts.len();
        let start = guard.cursor.map_or(0, |c| c + 1);
        let index = (0..count)
            .map(|offset| (start + offset) % count)
            .find(|&i| guard.accounts[i].is_usable(now, self.quota))?;
        guard.cursor = Some(index);
        let account = &guard.accounts[index];
        Some(AccountHandle {
            index,
            name: account.name.clone(),
            credential: account.credential.clone(),
        })
    }

    pub fn checkout(&self, index: usize) -> Option<AccountHandle> {
        let now = self.clock.now();
        let guard = lock(&self.state);
        let account = guard.accounts.get(index)?;
        account.is_usable(now, self.quota).then(|| AccountHandle {
            index,
            name: account.name.clone(),
            credential: account.credential.clone(),
        })
    }

    pub fn increment(&self, index: usize, n: u64) {
        let mut guard = lock(&self.state);
        if let Some(account) = guard.accounts.get_mut(index) {
            account.usage = account.usage.saturating_add(n);
        }
    }

    /// Keep the account out of rotation for `seconds`. Never shortens an
    /// existing deadline and leaves the usage counter untouched.
    pub fn mark_backoff(&self, index: usize, seconds: u64, reason: &str) {
        let deadline = shifted(self.clock.now(), Duration::from_secs(seconds));
        let mut guard = lock(&self.state);
        let Some(account) = guard.accounts.get_mut(index) else {
            return;
        };
        account.available_at = Some(account.available_at.map_or(deadline, |d| d.max(deadline)));
        account.last_failure = Some(reason.to_string());
        warn!(account = %account.name, seconds, reason, "account backed off");
    }

    pub fn is_available(&self, index: usize) -> bool {
        let now = self.clock.now();
        lock(&self.state)
            .accounts
            .get(index)
            .is_some_and(|a| a.is_available(now))
    }

    pub fn usage(&self, index: usize) -> Option<u64> {
        lock(&self.state).accounts.get(index).map(|a| a.usage)
    }

    pub fn name(&self, index: usize) -> Option<String> {
        lock(&self.state).accounts.get(index).map(|a| a.name.clone())
    }

    pub fn snapshot(&self) -> Vec<AccountSnapshot> {
        lock(&self.state)
            .accounts
            .iter()
            .map(|a| AccountSnapshot {
                name: a.name.clone(),
                usage: a.usage,
                available_at: a.available_at,
                last_failure: a.last_failure.clone(),
                has_credentials: !a.credential.is_empty(),
            })
            .collect()
    }

    pub async fn shutdown(&mut self) {
        if let Some(mut window) = self.window.take() {
            window.shutdown().await;
            info!("credential pool window stopped");
        }
    }
}
