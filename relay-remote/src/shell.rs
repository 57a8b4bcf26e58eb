use tokio::sync::mpsc;

/// Input written to the remote shell, applied in send order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellInput {
    Data(Vec<u8>),
    Close,
}

/// Output observed from the remote shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Closed,
}

/// The caller's side of an open interactive shell.
#[derive(Debug)]
pub struct ShellHandle {
    pub input: mpsc::UnboundedSender<ShellInput>,
    pub events: mpsc::UnboundedReceiver<ShellEvent>,
}

/// The shell owner's side: receives inputs, publishes events.
#[derive(Debug)]
pub struct ShellEndpoint {
    pub inputs: mpsc::UnboundedReceiver<ShellInput>,
    pub events: mpsc::UnboundedSender<ShellEvent>,
}

impl ShellHandle {
    /// Creates a connected handle/endpoint pair.
    pub fn pair() -> (ShellHandle, ShellEndpoint) {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            ShellHandle {
                input: input_tx,
                events: event_rx,
            },
            ShellEndpoint {
                inputs: input_rx,
                events: event_tx,
            },
        )
    }
}
