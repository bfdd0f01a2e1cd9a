use rumqttc::v5::{ClientError, ConnectionError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("connection lost `{0}`")]
    Connection(#[from] ConnectionError),
    #[error("client request failed `{0}`")]
    Client(#[from] ClientError),
    #[error("credit window closed")]
    CreditClosed,
    #[error("channel closed `{0}`")]
    Closed(String),
}
