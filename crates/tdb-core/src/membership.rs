use std::sync::Arc;

use crate::{
    domain::{ChatId, MemberStatus, UserId},
    messaging::port::MessagingPort,
};

/// Force-subscribe check: the user must belong to the gating channel.
#[derive(Clone)]
pub struct MembershipGate {
    messenger: Arc<dyn MessagingPort>,
    gating_chat: ChatId,
}

impl MembershipGate {
    pub fn new(messenger: Arc<dyn MessagingPort>, gating_chat: ChatId) -> Self {
        Self {
            messenger,
            gating_chat,
        }
    }

    /// Fail-closed: lookup errors count as "not a member".
    pub async fn is_member(&self, user_id: UserId) -> bool {
        match self.messenger.member_status(self.gating_chat, user_id).await {
            Ok(status) => grants_access(status),
            Err(e) => {
                tracing::error!(user_id = user_id.0, "error checking membership: {e}");
                false
            }
        }
    }
}

pub fn grants_access(status: MemberStatus) -> bool {
    matches!(
        status,
        MemberStatus::Member | MemberStatus::Administrator | MemberStatus::Owner
    )
}
