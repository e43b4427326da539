use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::sync::oneshot;

/// Creates the pair used to stop the RPC server: the Raft server holds the
/// handle, and dropping it (explicit shutdown or otherwise) resolves the
/// signal that `serve_with_shutdown` waits on.
pub fn shutdown_signal() -> (RpcServerShutdownHandle, RpcServerShutdownSignal) {
    let (tx, rx) = oneshot::channel();

    (RpcServerShutdownHandle { _tx: tx }, RpcServerShutdownSignal { rx })
}

pub struct RpcServerShutdownHandle {
    _tx: oneshot::Sender<()>,
}

pub struct RpcServerShutdownSignal {
    rx: oneshot::Receiver<()>,
}

impl Future for RpcServerShutdownSignal {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let rx = Pin::new(&mut self.rx);
        // Sent value and dropped sender both mean "stop".
        let _: Result<(), oneshot::error::RecvError> = ready!(rx.poll(cx));
        Poll::Ready(())
    }
}
