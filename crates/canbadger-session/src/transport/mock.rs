//! Mock transport for testing

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use canbadger_proto::{ActionKind, Message, MessageKind, COMMAND_PORT};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use super::{ProbeTransport, TransportError};

/// Scripted probe stand-in
///
/// Every sent datagram is recorded. Datagrams matching a registered prefix
/// trigger the scripted replies, which `recv` then hands out in order.
pub struct MockTransport {
    reply_port: u16,
    connected: AtomicBool,
    sent: Mutex<Vec<Bytes>>,
    incoming_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    incoming_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    /// Request prefix -> replies
    responses: RwLock<Vec<(Vec<u8>, Vec<Bytes>)>>,
}

impl MockTransport {
    pub fn new(reply_port: u16) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            reply_port,
            connected: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
            incoming_tx: Mutex::new(Some(tx)),
            incoming_rx: tokio::sync::Mutex::new(rx),
            responses: RwLock::new(Vec::new()),
        }
    }

    /// Reply with `replies` whenever a sent datagram starts with `prefix`
    pub fn add_response(&self, prefix: Vec<u8>, replies: Vec<Bytes>) {
        self.responses.write().push((prefix, replies));
    }

    /// Reply to every `ACTION` carrying `action`
    pub fn add_action_response(&self, action: ActionKind, replies: Vec<Message>) {
        self.add_response(
            vec![MessageKind::Action as u8, action as u8],
            replies.iter().map(Message::encode).collect(),
        );
    }

    /// Answer CONNECT datagrams with an ACK
    pub fn ack_connect(&self) {
        self.add_response(
            vec![MessageKind::Connect as u8],
            vec![Message::ack().encode()],
        );
    }

    /// Inject a datagram as if the probe had sent it
    pub fn inject_incoming(&self, datagram: impl Into<Bytes>) {
        if let Some(tx) = self.incoming_tx.lock().as_ref() {
            let _ = tx.send(datagram.into());
        }
    }

    pub fn inject_message(&self, message: &Message) {
        self.inject_incoming(message.encode());
    }

    /// Datagrams sent so far
    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    /// Sent datagrams decoded as envelopes, CONNECT datagrams included
    pub fn sent_messages(&self) -> Vec<Message> {
        self.sent()
            .iter()
            .filter_map(|raw| Message::decode(raw, true).ok())
            .collect()
    }

    /// Close the link; pending and future `recv` calls fail
    pub fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.incoming_tx.lock().take();
    }

    fn find_responses(&self, datagram: &[u8]) -> Vec<Bytes> {
        self.responses
            .read()
            .iter()
            .find(|(prefix, _)| datagram.starts_with(prefix))
            .map(|(_, replies)| replies.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ProbeTransport for MockTransport {
    async fn send(&self, datagram: &[u8]) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        tracing::debug!(len = datagram.len(), "Mock transport: sent datagram");
        self.sent.lock().push(Bytes::copy_from_slice(datagram));
        for reply in self.find_responses(datagram) {
            self.inject_incoming(reply);
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Bytes, TransportError> {
        self.incoming_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::ConnectionClosed)
    }

    fn reply_port(&self) -> u16 {
        self.reply_port
    }

    fn probe_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, COMMAND_PORT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_reply() {
        let mock = MockTransport::new(12000);
        mock.add_action_response(ActionKind::Settings, vec![Message::nack()]);

        mock.send(&Message::command(ActionKind::Settings).encode())
            .await
            .unwrap();
        let reply = mock.recv().await.unwrap();
        assert_eq!(Message::decode(&reply, true).unwrap(), Message::nack());
        assert_eq!(mock.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_close_ends_recv() {
        let mock = MockTransport::new(12000);
        mock.close();
        assert_eq!(mock.recv().await, Err(TransportError::ConnectionClosed));
        assert_eq!(
            mock.send(&[0]).await,
            Err(TransportError::ConnectionClosed)
        );
    }
}
