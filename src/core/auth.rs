//! Authorization gate.
//!
//! Checks are plain yes/no answers consulted before an operation runs. A
//! denial aborts the operation before it has any side effect. `None` as the
//! caller means the broker itself (configuration, admin API running in
//! process).

use std::collections::HashSet;
use std::fmt::Debug;

use crate::core::queue::options::QueueOptions;
use crate::core::subscriber::ClientId;

pub trait Authorizer: Send + Sync + Debug {
    fn can_create_queue(&self, _caller: Option<&ClientId>, _queue: &str, _options: &QueueOptions) -> bool {
        true
    }

    fn can_remove_queue(&self, _caller: Option<&ClientId>, _queue: &str) -> bool {
        true
    }

    fn can_update_options(&self, _caller: Option<&ClientId>, _queue: &str, _options: &QueueOptions) -> bool {
        true
    }

    fn can_subscribe(&self, _client: &ClientId, _queue: &str) -> bool {
        true
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authorizer for AllowAll {}

/// Restricts queue administration to a fixed set of client ids.
///
/// Subscribing stays open to everyone.
#[derive(Debug, Default, Clone)]
pub struct AdminListAuthorizer {
    admins: HashSet<ClientId>,
}

impl AdminListAuthorizer {
    pub fn new<I, S>(admins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ClientId>,
    {
        Self {
            admins: admins.into_iter().map(Into::into).collect(),
        }
    }

    fn is_admin(&self, caller: Option<&ClientId>) -> bool {
        caller.map_or(true, |id| self.admins.contains(id))
    }
}

impl Authorizer for AdminListAuthorizer {
    fn can_create_queue(&self, caller: Option<&ClientId>, _queue: &str, _options: &QueueOptions) -> bool {
        self.is_admin(caller)
    }

    fn can_remove_queue(&self, caller: Option<&ClientId>, _queue: &str) -> bool {
        self.is_admin(caller)
    }

    fn can_update_options(&self, caller: Option<&ClientId>, _queue: &str, _options: &QueueOptions) -> bool {
        self.is_admin(caller)
    }
}
