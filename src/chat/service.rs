//! Participant-checked reads and writes on chat sessions.

use std::sync::Arc;

use tracing::debug;

use super::model::{Message, NewMessage, Session, SessionKind, user_key};
use super::trigger::MessageTrigger;
use crate::error::{Result, SessionError};
use crate::store::Database;

pub struct ChatService {
    db: Arc<dyn Database>,
    trigger: MessageTrigger,
}

impl ChatService {
    pub fn new(db: Arc<dyn Database>, trigger: MessageTrigger) -> Self {
        Self { db, trigger }
    }

    /// The session `chat_id`, provided `uid` takes part in it.
    pub async fn session_for(&self, uid: &str, chat_id: &str) -> Result<Session> {
        let session = self
            .db
            .get_session(chat_id)
            .await?
            .ok_or_else(|| SessionError::ChatNotFound(chat_id.to_string()))?;
        if !session.has_participant(uid) {
            return Err(SessionError::NotParticipant {
                uid: uid.to_string(),
                chat_id: chat_id.to_string(),
            }
            .into());
        }
        Ok(session)
    }

    /// Store a user message. In a user-AI session this fires the reply
    /// trigger.
    pub async fn post_user_message(&self, uid: &str, chat_id: &str, text: &str) -> Result<Message> {
        if text.trim().is_empty() {
            return Err(SessionError::EmptyMessage.into());
        }
        let session = self.session_for(uid, chat_id).await?;
        let appended = self
            .db
            .append_message(&session.id, &NewMessage::user(uid, text))
            .await?;

        if session.kind == SessionKind::UserAi {
            self.trigger.fire(&session.id, &appended.message.id);
        }
        debug!(chat_id = %session.id, message_id = %appended.message.id, "User message stored");
        Ok(appended.message)
    }

    /// The latest `limit` messages, oldest first.
    pub async fn list_messages(&self, uid: &str, chat_id: &str, limit: usize) -> Result<Vec<Message>> {
        let session = self.session_for(uid, chat_id).await?;
        Ok(self.db.recent_messages(&session.id, limit, None).await?)
    }

    /// The caller's sessions, most recently active first.
    pub async fn list_chats(&self, uid: &str, limit: usize) -> Result<Vec<Session>> {
        Ok(self.db.list_sessions_for(&user_key(uid), None, limit).await?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::error::Error;
    use crate::store::LibSqlBackend;

    async fn service() -> (
        Arc<LibSqlBackend>,
        ChatService,
        tokio::sync::mpsc::UnboundedReceiver<crate::chat::trigger::MessageCreated>,
    ) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let (trigger, rx) = MessageTrigger::channel();
        (db.clone(), ChatService::new(db, trigger), rx)
    }

    #[tokio::test]
    async fn user_ai_message_fires_trigger() {
        let (db, service, mut rx) = service().await;
        let session = Session::user_ai("u1", None, None, Utc::now());
        db.insert_session_if_absent(&session).await.unwrap();

        let msg = service.post_user_message("u1", &session.id, "hi").await.unwrap();
        let event = rx.try_recv().unwrap();
        assert_eq!(event.chat_id, session.id);
        assert_eq!(event.message_id, msg.id);
    }

    #[tokio::test]
    async fn user_user_message_does_not_fire() {
        let (db, service, mut rx) = service().await;
        let session = Session::user_user("a", "b", Utc::now());
        db.insert_session_if_absent(&session).await.unwrap();

        service.post_user_message("b", &session.id, "hey").await.unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(service.list_messages("a", &session.id, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn outsiders_and_blank_text_are_rejected() {
        let (db, service, _rx) = service().await;
        let session = Session::user_ai("u1", None, None, Utc::now());
        db.insert_session_if_absent(&session).await.unwrap();

        assert!(matches!(
            service.post_user_message("u2", &session.id, "hi").await,
            Err(Error::Session(SessionError::NotParticipant { .. }))
        ));
        assert!(matches!(
            service.post_user_message("u1", &session.id, "   ").await,
            Err(Error::Session(SessionError::EmptyMessage))
        ));
        assert!(matches!(
            service.list_messages("u1", "missing", 10).await,
            Err(Error::Session(SessionError::ChatNotFound(_)))
        ));
        assert_eq!(db.count_messages(&session.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn list_chats_only_returns_own_sessions() {
        let (db, service, _rx) = service().await;
        db.insert_session_if_absent(&Session::user_ai("u1", None, None, Utc::now()))
            .await
            .unwrap();
        db.insert_session_if_absent(&Session::user_user("u1", "u2", Utc::now()))
            .await
            .unwrap();
        db.insert_session_if_absent(&Session::user_ai("u3", None, None, Utc::now()))
            .await
            .unwrap();

        assert_eq!(service.list_chats("u1", 10).await.unwrap().len(), 2);
        assert_eq!(service.list_chats("u2", 10).await.unwrap().len(), 1);
    }
}
