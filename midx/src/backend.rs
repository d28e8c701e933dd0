//! The small trait a mailbox format (maildir, mbox, dbox) implements to
//! receive sync callbacks, replacing the source's function-pointer vtable
//! dispatch (§9). The sync engine only ever calls through this interface;
//! it never knows which concrete format is on the other end.
//!
//! `fsck`'s filesystem-enumeration fallback (§4.4: "if the log itself is
//! unusable... rebuilds from the backend's enumeration") is the one place
//! the core needs to call back into the backend outside of a normal sync
//! pass, hence [`Backend::enumerate`].

use crate::error::Result;

/// One message as the backend sees it, prior to having been assigned a
/// UID by the core.
pub struct EnumeratedMessage {
    /// Backend-local stable identifier (e.g. a maildir filename), opaque
    /// to the core.
    pub backend_key: String,
    pub flags: u8,
}

pub trait Backend {
    /// List every message currently present in backend storage, in an
    /// implementation-defined but stable order. Used only by `fsck`'s
    /// UIDVALIDITY-reset rebuild path (§4.4), never by a normal sync.
    fn enumerate(&self) -> Result<Vec<EnumeratedMessage>>;

    /// Fetch the raw bytes for one message.
    fn read(&self, backend_key: &str) -> Result<Vec<u8>>;

    /// Persist a brand-new message, returning the `backend_key` the core
    /// should remember for later `update_flags`/`expunge` calls against it.
    fn write(&self, uid: u32, data: &[u8]) -> Result<String>;

    /// Apply a flag delta the backend hadn't already applied itself (an
    /// internal transaction's dirty-flag sync, §4.4 step 6).
    fn update_flags(&self, backend_key: &str, add_flags: u8, remove_flags: u8) -> Result<()>;

    /// Remove a message the core has expunged.
    fn expunge(&self, backend_key: &str) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// An in-memory backend for exercising the sync engine in tests
    /// without touching real maildir/mbox/dbox storage.
    #[derive(Default)]
    pub struct MemoryBackend {
        pub messages: RefCell<HashMap<String, (u8, Vec<u8>)>>,
        pub next_key: RefCell<u32>,
    }

    impl Backend for MemoryBackend {
        fn enumerate(&self) -> Result<Vec<EnumeratedMessage>> {
            Ok(self
                .messages
                .borrow()
                .iter()
                .map(|(k, (flags, _))| EnumeratedMessage {
                    backend_key: k.clone(),
                    flags: *flags,
                })
                .collect())
        }

        fn read(&self, backend_key: &str) -> Result<Vec<u8>> {
            Ok(self.messages.borrow().get(backend_key).map(|(_, d)| d.clone()).unwrap_or_default())
        }

        fn write(&self, uid: u32, data: &[u8]) -> Result<String> {
            let mut next = self.next_key.borrow_mut();
            *next += 1;
            let key = format!("msg-{uid}-{next}");
            self.messages.borrow_mut().insert(key.clone(), (0, data.to_vec()));
            Ok(key)
        }

        fn update_flags(&self, backend_key: &str, add_flags: u8, remove_flags: u8) -> Result<()> {
            if let Some(entry) = self.messages.borrow_mut().get_mut(backend_key) {
                entry.0 = (entry.0 | add_flags) & !remove_flags;
            }
            Ok(())
        }

        fn expunge(&self, backend_key: &str) -> Result<()> {
            self.messages.borrow_mut().remove(backend_key);
            Ok(())
        }
    }
}
