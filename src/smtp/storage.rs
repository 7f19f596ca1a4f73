//! Mail persistence collaborator

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::smtp::error::SmtpError;
use crate::smtp::mail::MailTx;

/// Persists transactions while they are in the pipeline.
///
/// Called concurrently from connection threads and delivery workers.
pub trait Storage: Send + Sync {
    fn mail_save(&self, mail: &MailTx) -> Result<(), SmtpError>;

    fn mail_load(&self, id: u64) -> Result<MailTx, SmtpError>;

    /// All pending (not bounced) transactions, oldest first
    fn mail_load_all(&self) -> Result<Vec<MailTx>, SmtpError>;

    fn mail_delete(&self, id: u64) -> Result<(), SmtpError>;

    /// Move a saved transaction into the bounced partition
    fn mail_bounce(&self, id: u64) -> Result<(), SmtpError>;
}

#[derive(Debug, Default)]
struct Partitions {
    pending: BTreeMap<u64, MailTx>,
    bounced: BTreeMap<u64, MailTx>,
}

/// In-memory storage, suitable for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: Mutex<Partitions>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Partitions>, SmtpError> {
        self.inner
            .lock()
            .map_err(|_| SmtpError::Storage("storage lock poisoned".to_string()))
    }

    /// Load a transaction from the bounced partition
    pub fn load_bounced(&self, id: u64) -> Result<MailTx, SmtpError> {
        self.lock()?
            .bounced
            .get(&id)
            .cloned()
            .ok_or(SmtpError::NotFound(id))
    }

    /// All bounced transactions, oldest first
    pub fn bounced(&self) -> Vec<MailTx> {
        self.lock()
            .map(|p| p.bounced.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().map(|p| p.pending.len()).unwrap_or(0)
    }
}

impl Storage for MemoryStorage {
    fn mail_save(&self, mail: &MailTx) -> Result<(), SmtpError> {
        self.lock()?.pending.insert(mail.id, mail.clone());
        Ok(())
    }

    fn mail_load(&self, id: u64) -> Result<MailTx, SmtpError> {
        self.lock()?
            .pending
            .get(&id)
            .cloned()
            .ok_or(SmtpError::NotFound(id))
    }

    fn mail_load_all(&self) -> Result<Vec<MailTx>, SmtpError> {
        Ok(self.lock()?.pending.values().cloned().collect())
    }

    fn mail_delete(&self, id: u64) -> Result<(), SmtpError> {
        self.lock()?
            .pending
            .remove(&id)
            .map(|_| ())
            .ok_or(SmtpError::NotFound(id))
    }

    fn mail_bounce(&self, id: u64) -> Result<(), SmtpError> {
        let mut partitions = self.lock()?;
        let mail = partitions
            .pending
            .remove(&id)
            .ok_or(SmtpError::NotFound(id))?;
        partitions.bounced.insert(id, mail);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mail() -> MailTx {
        MailTx::new("a@b".to_string(), vec!["c@d".to_string()], b"hi\r\n")
    }

    #[test]
    fn test_save_load_delete() {
        let storage = MemoryStorage::new();
        let mail = mail();

        storage.mail_save(&mail).unwrap();
        assert_eq!(storage.mail_load(mail.id).unwrap(), mail);
        assert_eq!(storage.mail_load_all().unwrap().len(), 1);

        storage.mail_delete(mail.id).unwrap();
        assert!(matches!(
            storage.mail_load(mail.id),
            Err(SmtpError::NotFound(_))
        ));
        assert!(storage.mail_delete(mail.id).is_err());
    }

    #[test]
    fn test_load_all_is_ordered() {
        let storage = MemoryStorage::new();
        let first = mail();
        let second = mail();
        storage.mail_save(&second).unwrap();
        storage.mail_save(&first).unwrap();

        let ids: Vec<u64> = storage
            .mail_load_all()
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[test]
    fn test_bounce_moves_partition() {
        let storage = MemoryStorage::new();
        let mail = mail();
        storage.mail_save(&mail).unwrap();

        storage.mail_bounce(mail.id).unwrap();
        assert_eq!(storage.load_bounced(mail.id).unwrap(), mail);
        assert!(storage.mail_load(mail.id).is_err());
        assert!(storage.mail_load_all().unwrap().is_empty());
        assert_eq!(storage.bounced().len(), 1);
    }

    #[test]
    fn test_bounce_unknown_id() {
        let storage = MemoryStorage::new();
        assert!(matches!(storage.mail_bounce(42), Err(SmtpError::NotFound(42))));
    }
}
