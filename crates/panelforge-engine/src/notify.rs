use std::sync::Mutex;

use panelforge_contracts::{Journal, NotificationRecord, PageProgress};

pub use panelforge_contracts::NotificationKind;

/// Notification ids are stable per gallery so progress updates replace each other.
pub const NOTIFICATION_ID_BASE: u64 = 70_000;

pub fn notification_id(gallery_id: u64) -> u64 {
    NOTIFICATION_ID_BASE.saturating_add(gallery_id)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: u64,
    pub channel: String,
    pub kind: NotificationKind,
    pub gallery_id: u64,
    pub title: String,
    pub message: String,
    /// `(done, total)` for progress updates.
    pub progress: Option<(usize, usize)>,
}

impl Notification {
    pub fn new(
        channel: impl Into<String>,
        kind: NotificationKind,
        gallery_id: u64,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: notification_id(gallery_id),
            channel: channel.into(),
            kind,
            gallery_id,
            title: title.into(),
            message: message.into(),
            progress: None,
        }
    }

    pub fn with_progress(mut self, done: usize, total: usize) -> Self {
        self.progress = Some((done, total));
        self
    }

    /// Journal line for this notification; the journal stamps the time.
    pub fn to_record(&self) -> NotificationRecord {
        NotificationRecord {
            notification_id: self.id,
            channel: self.channel.clone(),
            kind: self.kind,
            gallery_id: self.gallery_id,
            title: self.title.clone(),
            message: self.message.clone(),
            progress: self
                .progress
                .map(|(done, total)| PageProgress { done, total }),
            ts: String::new(),
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification);
}

/// Appends each notification to the journal and mirrors it to the log.
pub struct JournalNotifier {
    journal: Journal,
}

impl JournalNotifier {
    pub fn new(journal: Journal) -> Self {
        Self { journal }
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }
}

impl Notifier for JournalNotifier {
    fn notify(&self, notification: &Notification) {
        match notification.kind {
            NotificationKind::Failed | NotificationKind::Rejected => log::warn!(
                "[{}] {}: {}",
                notification.channel,
                notification.title,
                notification.message
            ),
            NotificationKind::Progress => log::debug!(
                "[{}] {}: {}",
                notification.channel,
                notification.title,
                notification.message
            ),
            _ => log::info!(
                "[{}] {}: {}",
                notification.channel,
                notification.title,
                notification.message
            ),
        }
        if let Err(err) = self.journal.append(notification.to_record()) {
            log::warn!(
                "failed writing notification to {}: {err:#}",
                self.journal.path().display()
            );
        }
    }
}

/// Keeps notifications in memory; handy for embedding and tests.
#[derive(Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_default()
    }

    pub fn kinds(&self) -> Vec<NotificationKind> {
        self.sent().iter().map(|notification| notification.kind).collect()
    }
}

impl Notifier for MemoryNotifier {
    fn notify(&self, notification: &Notification) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(notification.clone());
        }
    }
}
