//! Single entry point that executes [`Operation`]s on behalf of a session.

use std::sync::Arc;

use teamsplit_core::{EngineError, SessionId};

use crate::admin::RosterAdmin;
use crate::lifecycle::MatchLifecycle;
use crate::presence::PresenceRegistry;
use crate::protocol::{Operation, Reply};
use crate::store::SharedStateStore;
use crate::verification::{VerificationConfig, VerificationDispatcher, VerificationGate};

/// Owns one instance of every engine component over a shared store.
pub struct Coordinator {
    store: Arc<SharedStateStore>,
    presence: PresenceRegistry,
    lifecycle: MatchLifecycle,
    admin: RosterAdmin,
    gate: VerificationGate,
    require_verification: bool,
}

impl Coordinator {
    pub fn new(
        store: Arc<SharedStateStore>,
        dispatcher: Arc<dyn VerificationDispatcher>,
        verification: VerificationConfig,
        require_verification: bool,
    ) -> Self {
        Self {
            presence: PresenceRegistry::new(store.clone()),
            lifecycle: MatchLifecycle::new(store.clone()),
            admin: RosterAdmin::new(store.clone()),
            gate: VerificationGate::new(store.clone(), dispatcher, verification),
            store,
            require_verification,
        }
    }

    pub fn store(&self) -> &Arc<SharedStateStore> {
        &self.store
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn lifecycle(&self) -> &MatchLifecycle {
        &self.lifecycle
    }

    pub fn admin(&self) -> &RosterAdmin {
        &self.admin
    }

    pub fn gate(&self) -> &VerificationGate {
        &self.gate
    }

    pub fn requires_verification(&self) -> bool {
        self.require_verification
    }

    /// Run `op` for `session`.
    pub async fn execute(&self, session: SessionId, op: Operation) -> Result<Reply, EngineError> {
        match op {
            Operation::RequestCode { participant } => {
                let channel = self.gate.request_code(&participant, session).await?;
                Ok(Reply::CodeSent(channel))
            }
            Operation::VerifyCode { participant, code } => {
                let (_, snapshot) = self.gate.verify_and_claim(&participant, session, &code).await?;
                Ok(Reply::Ack { version: snapshot.version })
            }
            Operation::Claim { participant } => {
                if self.require_verification {
                    return Err(EngineError::VerificationRequired);
                }
                let (_, snapshot) = self.presence.claim(&participant, session).await?;
                Ok(Reply::Ack { version: snapshot.version })
            }
            Operation::Release => {
                let (_, snapshot) = self.presence.release_session(session).await?;
                Ok(Reply::Ack { version: snapshot.version })
            }
            Operation::ReleaseParticipant { participant } => {
                let snapshot = self.presence.release(&participant).await?;
                Ok(Reply::Ack { version: snapshot.version })
            }
            Operation::IsOnline { participant } => {
                Ok(Reply::Online(self.presence.is_online(&participant).await))
            }
            Operation::CreateMatch { room } => {
                Ok(Reply::Match(self.lifecycle.create_match(&room).await?))
            }
            Operation::Join { match_id, participant } => {
                let (entry, outcome) = self.lifecycle.join(match_id, &participant).await?;
                Ok(Reply::Joined { entry, outcome })
            }
            Operation::JoinRoom { room, participant } => {
                let (entry, outcome) = self.lifecycle.join_room(&room, &participant).await?;
                Ok(Reply::Joined { entry, outcome })
            }
            Operation::DeleteRoom { room } => {
                let matches_removed = self.lifecycle.delete_room(&room).await?;
                Ok(Reply::RoomDeleted { matches_removed })
            }
            Operation::AddParticipant(new) => {
                Ok(Reply::ParticipantAdded(self.admin.add_participant(&new).await?))
            }
            Operation::UpdateParticipant { id, patch } => {
                let snapshot = self.admin.update_participant(&id, &patch).await?;
                Ok(Reply::Ack { version: snapshot.version })
            }
            Operation::DeleteParticipant { id } => {
                let snapshot = self.admin.delete_participant(&id).await?;
                Ok(Reply::Ack { version: snapshot.version })
            }
            Operation::AddRoom(new) => Ok(Reply::RoomAdded(self.admin.add_room(&new).await?)),
            Operation::UpdateRoom { id, patch } => {
                let snapshot = self.admin.update_room(&id, &patch).await?;
                Ok(Reply::Ack { version: snapshot.version })
            }
            Operation::SetCredentialHashes { shared, admin } => {
                let snapshot = self.admin.set_credential_hashes(shared, admin).await?;
                Ok(Reply::Ack { version: snapshot.version })
            }
            Operation::Export => Ok(Reply::Exported(self.admin.export_state().await?)),
            Operation::Import { json } => {
                let snapshot = self.admin.import_state(&json).await?;
                Ok(Reply::Ack { version: snapshot.version })
            }
        }
    }

    /// Clean up after a session that went away.
    pub async fn end_session(&self, session: SessionId) -> Result<(), EngineError> {
        self.gate.forget_session(session).await;
        self.presence.release_session(session).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::{NewParticipant, NewRoom};
    use crate::lifecycle::JoinOutcome;
    use crate::verification::{ChannelDispatcher, DispatchedCode};
    use teamsplit_core::{MatchStatus, ParticipantId, Role};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn coordinator(require_verification: bool) -> (Coordinator, UnboundedReceiver<DispatchedCode>) {
        let store = Arc::new(SharedStateStore::in_memory());
        let (dispatcher, rx) = ChannelDispatcher::new();
        let c = Coordinator::new(
            store,
            Arc::new(dispatcher),
            VerificationConfig::default(),
            require_verification,
        );
        (c, rx)
    }

    fn player(name: &str, level: u32) -> Operation {
        Operation::AddParticipant(NewParticipant {
            name: name.into(),
            level,
            role: Role::Mid,
            email: Some(format!("{name}@example.com")),
            phone: None,
        })
    }

    async fn add(c: &Coordinator, name: &str, level: u32) -> ParticipantId {
        match c.execute(SessionId::new(), player(name, level)).await.unwrap() {
            Reply::ParticipantAdded(id) => id,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_raw_claim_requires_flag() {
        let (c, _rx) = coordinator(true);
        let p = add(&c, "ash", 10).await;
        assert_eq!(
            c.execute(SessionId::new(), Operation::Claim { participant: p }).await,
            Err(EngineError::VerificationRequired)
        );
    }

    #[tokio::test]
    async fn test_verified_claim_and_full_match() {
        let (c, mut rx) = coordinator(true);
        let room = match c
            .execute(
                SessionId::new(),
                Operation::AddRoom(NewRoom { name: "Solo".into(), team_size: 1, description: None }),
            )
            .await
            .unwrap()
        {
            Reply::RoomAdded(id) => id,
            other => panic!("unexpected {other:?}"),
        };

        let mut last = None;
        for (name, level) in [("ash", 10), ("brook", 12)] {
            let p = add(&c, name, level).await;
            let session = SessionId::new();
            c.execute(session, Operation::RequestCode { participant: p.clone() })
                .await
                .unwrap();
            let code = rx.recv().await.unwrap().code;
            c.execute(session, Operation::VerifyCode { participant: p.clone(), code })
                .await
                .unwrap();
            assert_eq!(
                c.execute(session, Operation::IsOnline { participant: p.clone() }).await,
                Ok(Reply::Online(true))
            );
            last = Some(
                c.execute(session, Operation::JoinRoom { room: room.clone(), participant: p })
                    .await
                    .unwrap(),
            );
        }

        match last {
            Some(Reply::Joined { entry, outcome: JoinOutcome::Assigned(stats) }) => {
                assert_eq!(entry.status, MatchStatus::Assigned);
                assert_eq!(stats.level_diff, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_end_session_releases_claim() {
        let (c, _rx) = coordinator(false);
        let p = add(&c, "ash", 10).await;
        let session = SessionId::new();
        c.execute(session, Operation::Claim { participant: p.clone() }).await.unwrap();
        assert!(c.presence().is_online(&p).await);

        c.end_session(session).await.unwrap();
        assert!(!c.presence().is_online(&p).await);
    }

    #[tokio::test]
    async fn test_export_reply() {
        let (c, _rx) = coordinator(false);
        add(&c, "ash", 10).await;
        match c.execute(SessionId::new(), Operation::Export).await.unwrap() {
            Reply::Exported(json) => assert!(json.contains("\"gameName\": \"ash\"")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
