//! Routing of host answers to the watch task of a running command.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use rexec_core::{CommandId, Error, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::watch::WatchInput;

type Routes = HashMap<CommandId, mpsc::UnboundedSender<WatchInput>>;

/// Registry of watched commands.
#[derive(Debug, Clone, Default)]
pub struct InteractionRouter {
    routes: Arc<Mutex<Routes>>,
}

impl InteractionRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route inputs for `command_id` to `inputs` until the guard is dropped.
    pub fn register(
        &self,
        command_id: CommandId,
        inputs: mpsc::UnboundedSender<WatchInput>,
    ) -> RouteGuard {
        self.lock().insert(command_id, inputs);
        debug!("Registered interaction route for {}", command_id);
        RouteGuard {
            router: self.clone(),
            command_id,
        }
    }

    /// Whether `command_id` is being watched.
    pub fn contains(&self, command_id: CommandId) -> bool {
        self.lock().contains_key(&command_id)
    }

    /// Number of watched commands.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no command is watched.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Type `input` into the command and resume detection.
    pub async fn submit(
        &self,
        command_id: CommandId,
        input: &str,
        append_newline: bool,
    ) -> Result<()> {
        let (reply, result) = oneshot::channel();
        self.send(
            command_id,
            WatchInput::Submit {
                input: input.to_string(),
                append_newline,
                reply,
            },
        )?;
        result
            .await
            .map_err(|_| Error::CommandNotFound(command_id))?
            .map_err(Error::from)
    }

    /// Send the exit key (or an interrupt) and resume detection.
    pub async fn cancel(&self, command_id: CommandId) -> Result<()> {
        let (reply, result) = oneshot::channel();
        self.send(command_id, WatchInput::Cancel { reply })?;
        result
            .await
            .map_err(|_| Error::CommandNotFound(command_id))?
            .map_err(Error::from)
    }

    /// Close the prompt without answering.
    pub fn dismiss(&self, command_id: CommandId) -> Result<()> {
        self.send(command_id, WatchInput::Dismiss)
    }

    /// Stop raising prompts for the command.
    pub fn suppress(&self, command_id: CommandId) -> Result<()> {
        self.send(command_id, WatchInput::Suppress)
    }

    /// Raise prompts again and reset dismissals.
    pub fn unsuppress(&self, command_id: CommandId) -> Result<()> {
        self.send(command_id, WatchInput::Unsuppress)
    }

    fn send(&self, command_id: CommandId, input: WatchInput) -> Result<()> {
        let routes = self.lock();
        let inputs = routes
            .get(&command_id)
            .ok_or(Error::CommandNotFound(command_id))?;
        inputs
            .send(input)
            .map_err(|_| Error::CommandNotFound(command_id))
    }

    fn lock(&self) -> MutexGuard<'_, Routes> {
        // The map stays consistent even if a holder panicked.
        self.routes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Keeps a route registered; dropping it stops the watch task and removes
/// the route.
#[derive(Debug)]
pub struct RouteGuard {
    router: InteractionRouter,
    command_id: CommandId,
}

impl RouteGuard {
    /// Command this guard routes for.
    pub fn command_id(&self) -> CommandId {
        self.command_id
    }
}

impl Drop for RouteGuard {
    fn drop(&mut self) {
        if let Some(inputs) = self.router.lock().remove(&self.command_id) {
            let _ = inputs.send(WatchInput::Stop);
            debug!("Removed interaction route for {}", self.command_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_removes_route() {
        let router = InteractionRouter::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = CommandId::new();

        let guard = router.register(id, tx);
        assert!(router.contains(id));
        assert_eq!(router.len(), 1);

        drop(guard);
        assert!(router.is_empty());
        assert!(matches!(rx.try_recv(), Ok(WatchInput::Stop)));
    }

    #[test]
    fn test_unknown_command() {
        let router = InteractionRouter::new();
        let id = CommandId::new();
        assert!(matches!(router.dismiss(id), Err(Error::CommandNotFound(_))));
        assert!(matches!(router.suppress(id), Err(Error::CommandNotFound(_))));
    }

    #[test]
    fn test_messages_are_forwarded() {
        let router = InteractionRouter::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = CommandId::new();
        let _guard = router.register(id, tx);

        router.dismiss(id).unwrap();
        router.suppress(id).unwrap();
        router.unsuppress(id).unwrap();
        assert!(matches!(rx.try_recv(), Ok(WatchInput::Dismiss)));
        assert!(matches!(rx.try_recv(), Ok(WatchInput::Suppress)));
        assert!(matches!(rx.try_recv(), Ok(WatchInput::Unsuppress)));
    }

    #[tokio::test]
    async fn test_submit_waits_for_write_result() {
        let router = InteractionRouter::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = CommandId::new();
        let _guard = router.register(id, tx);

        let responder = tokio::spawn(async move {
            match rx.recv().await {
                Some(WatchInput::Submit {
                    input,
                    append_newline,
                    reply,
                }) => {
                    assert_eq!(input, "yes");
                    assert!(append_newline);
                    reply
                        .send(Err(rexec_core::TransportFailure::NotWritable))
                        .unwrap();
                }
                other => panic!("unexpected input {other:?}"),
            }
        });

        let err = router.submit(id, "yes", true).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Transport(rexec_core::TransportFailure::NotWritable)
        ));
        responder.await.unwrap();
    }
}
