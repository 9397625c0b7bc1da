use crate::service::ServiceState;
use async_channel;

// ControlMsg is how other tasks talk to a running
// subscription loop
#[derive(Debug)]
pub enum ControlMsg {
    Health(async_channel::Sender<ControlMsg>),
    Heartbeat(ServiceState, u128),
    Shutdown,
}

pub type ControlSender = async_channel::Sender<ControlMsg>;
pub type ControlReceiver = async_channel::Receiver<ControlMsg>;
pub type ControlInbox = (ControlSender, ControlReceiver);
