use axum::extract::ws::Message;
use tokio::sync::mpsc;

use abi::errors::Error;
use abi::model::ServerFrame;

/// outbound handle for one live connection
///
/// holds the sending side of the connection's write queue; a writer task
/// owned by the connection pumps the queue into the websocket sink, so
/// nothing here ever touches the socket directly
#[derive(Clone)]
pub struct Client {
    pub name: String,
    sender: mpsc::Sender<Message>,
}

impl Client {
    pub fn new(name: impl Into<String>, sender: mpsc::Sender<Message>) -> Self {
        Self {
            name: name.into(),
            sender,
        }
    }

    pub async fn send_frame(&self, frame: &ServerFrame) -> Result<(), Error> {
        let text = serde_json::to_string(frame)?;
        self.send_raw(Message::Text(text)).await
    }

    pub async fn send_raw(&self, msg: Message) -> Result<(), Error> {
        self.sender
            .send(msg)
            .await
            .map_err(|_| Error::broadcast(format!("connection to {} is closed", self.name)))
    }
}
