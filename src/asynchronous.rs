//! Fire-and-poll operation calls.

use std::{
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
    thread,
    time::Duration,
};

use crate::{
    app_var::AppVar,
    error::{Error, FriendlyOperationException, Result},
    operation::{self, OperationTypeInfo, Positional, Talker},
    protocol::{Payload, ProtocolType, ReturnInfo},
};

/// Token making one operation call asynchronous.
///
/// Pass it to [`FriendlyOperation::with_async`](crate::operation::FriendlyOperation::with_async)
/// or anywhere in the argument list. The call then returns as soon as the target process accepted
/// it, and completion is observed by polling a result slot allocated in the target process.
///
/// A token serves a single call: `Unbound -> Bound -> Submitting -> Running`, or
/// `Unbound -> Completed` through [`complete_externally`](Async::complete_externally). Only one
/// call can move it to `Submitting`; a usage error detected before sending moves it back.
pub struct Async {
    state: Mutex<AsyncState>,
    poll_interval: Duration,
}

enum AsyncState {
    Unbound,
    Bound,
    Submitting,
    Running { slot: AppVar },
    Completed,
}

impl AsyncState {
    fn name(&self) -> &'static str {
        match self {
            AsyncState::Unbound => "unbound",
            AsyncState::Bound => "bound",
            AsyncState::Submitting => "submitting",
            AsyncState::Running { .. } => "running",
            AsyncState::Completed => "completed",
        }
    }
}

/// How a token reached the call using it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Binding {
    /// Bound beforehand with `FriendlyOperation::with_async`.
    Builder,
    /// Found in the argument list, bound by the call itself.
    Arguments,
}

impl Async {
    /// Delay between two checks of a running call.
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

    /// Unbound token polling every [`DEFAULT_POLL_INTERVAL`](Self::DEFAULT_POLL_INTERVAL).
    pub fn new() -> Self {
        Self::with_poll_interval(Self::DEFAULT_POLL_INTERVAL)
    }

    /// Token whose waits poll every `poll_interval`.
    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            state: Mutex::new(AsyncState::Unbound),
            poll_interval,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn state(&self) -> MutexGuard<'_, AsyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn bind(&self) -> Result<()> {
        let mut state = self.state();
        match *state {
            AsyncState::Unbound => {
                *state = AsyncState::Bound;
                Ok(())
            }
            _ => Err(Error::AsyncAlreadyUsed),
        }
    }

    /// Moves the token to `Submitting` and returns the state to restore on a usage error.
    fn begin(&self, binding: Binding) -> Result<AsyncState> {
        let mut state = self.state();
        let ready = match binding {
            Binding::Builder => matches!(*state, AsyncState::Bound),
            Binding::Arguments => matches!(*state, AsyncState::Unbound),
        };
        if !ready {
            return Err(Error::AsyncAlreadyUsed);
        }
        Ok(std::mem::replace(&mut *state, AsyncState::Submitting))
    }

    /// Checks the call, allocates the result slot then submits the call with the slot as first
    /// argument.
    ///
    /// Nothing is sent if the target or an argument is unusable, and the token is left as it was.
    /// A submission failure completes the token without any deposited response.
    pub(crate) fn invoke(
        &self,
        binding: Binding,
        talker: &Talker<'_>,
        type_info: Option<&OperationTypeInfo>,
        operation: &str,
        args: &[Positional<'_>],
    ) -> Result<AppVar> {
        let previous = self.begin(binding)?;

        let checked = talker
            .target()
            .and_then(|_| operation::marshal_all(talker.app(), args));
        let arguments = match checked {
            Ok(arguments) => arguments,
            Err(err) => {
                *self.state() = previous;
                return Err(err);
            }
        };

        let submitted = Self::submit(talker, type_info, operation, arguments);
        let mut state = self.state();
        match submitted {
            Ok((slot, result)) => {
                *state = AsyncState::Running { slot };
                Ok(result)
            }
            Err(err) => {
                *state = AsyncState::Completed;
                Err(err)
            }
        }
    }

    fn submit(
        talker: &Talker<'_>,
        type_info: Option<&OperationTypeInfo>,
        operation: &str,
        arguments: Vec<Payload>,
    ) -> Result<(AppVar, AppVar)> {
        let app = talker.app();
        let payload = operation::send(
            app,
            ProtocolType::AsyncResultVarInitialize,
            None,
            None,
            "",
            "",
            Vec::new(),
        )?;
        let slot = operation::into_var(app, payload)?;

        let mut with_slot = Vec::with_capacity(arguments.len() + 1);
        with_slot.push(slot.payload()?);
        with_slot.extend(arguments);
        let payload =
            talker.send_marshaled(ProtocolType::AsyncOperation, type_info, operation, with_slot)?;
        let result = operation::into_result(app, payload)?;
        Ok((slot, result))
    }

    /// Whether the call finished. One cheap request per check while running.
    pub fn is_completed(&self) -> Result<bool> {
        match &*self.state() {
            AsyncState::Unbound | AsyncState::Bound | AsyncState::Submitting => Ok(false),
            AsyncState::Running { slot } => Ok(!slot.is_null()?),
            AsyncState::Completed => Ok(true),
        }
    }

    /// Blocks the calling thread until the call finished.
    ///
    /// There is no timeout: a call which never completes blocks forever.
    pub fn wait_for_completion(&self) -> Result<()> {
        while !self.is_completed()? {
            thread::sleep(self.poll_interval);
        }
        Ok(())
    }

    /// Resolves once the call finished, sleeping on an [`async_io::Timer`] between checks.
    ///
    /// The checks themselves are blocking round trips.
    pub async fn completion(&self) -> Result<()> {
        while !self.is_completed()? {
            async_io::Timer::after(self.poll_interval).await;
        }
        Ok(())
    }

    /// Failure the call ended with, if it completed with one.
    pub fn executing_exception(&self) -> Result<Option<FriendlyOperationException>> {
        let state = self.state();
        let AsyncState::Running { slot } = &*state else {
            return Ok(None);
        };
        if slot.is_null()? {
            return Ok(None);
        }
        let response: ReturnInfo = serde_json::from_value(slot.raw_value()?)?;
        match response {
            ReturnInfo::Return(_) => Ok(None),
            ReturnInfo::Exception(info) => Ok(Some(FriendlyOperationException::new(info))),
        }
    }

    /// Marks an unused token completed, for calls finished by other means.
    pub fn complete_externally(&self) -> Result<()> {
        let mut state = self.state();
        match *state {
            AsyncState::Unbound => {
                *state = AsyncState::Completed;
                Ok(())
            }
            _ => Err(Error::InvalidCompletion),
        }
    }
}

impl Default for Async {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Async {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Async")
            .field("state", &self.state().name())
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::{mpsc, Barrier};

    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::{
        app_friend::{tests::counting_app, AppFriend},
        args,
        error::TokenKind,
        operate::local::{LocalExecutor, TypeDef},
        operation::Arg,
    };

    /// Executor with a `Demo.Gate` type whose `Wait` blocks until the returned sender fires.
    fn gated_app() -> (AppFriend, mpsc::Sender<()>) {
        let (open, gate) = mpsc::channel::<()>();
        let gate = Mutex::new(gate);
        let executor = LocalExecutor::new();
        executor.register_type(
            TypeDef::new("Demo.Gate")
                .constructor(|_| Ok(json!({})))
                .operation("Wait", move |_, _| {
                    let _ = gate.lock().unwrap().recv();
                    Ok(json!("done"))
                })
                .operation("Fail", |_, _| Err("gate jammed".into()))
                .static_operation("Echo", |args| Ok(args.first().cloned().unwrap_or_default())),
        );
        (executor.app(), open)
    }

    #[test]
    fn test_async_call_completes() {
        let (app, open) = gated_app();
        let gate = app.construct("Demo.Gate", &[]).unwrap();
        let token = Async::new();

        let result = gate
            .operation("Wait")
            .with_async(&token)
            .unwrap()
            .call(&[])
            .unwrap();
        assert!(!token.is_completed().unwrap());
        assert_eq!(token.executing_exception().unwrap(), None);

        open.send(()).unwrap();
        token.wait_for_completion().unwrap();
        assert!(token.is_completed().unwrap());
        assert_eq!(result.value::<String>().unwrap(), "done");
        assert_eq!(token.executing_exception().unwrap(), None);
    }

    #[test]
    fn test_async_failure_is_captured() {
        let (app, _open) = gated_app();
        let gate = app.construct("Demo.Gate", &[]).unwrap();
        let token = Async::with_poll_interval(Duration::from_millis(1));

        gate.operation("Fail").call(&args![&token]).unwrap();
        token.wait_for_completion().unwrap();

        let exception = token.executing_exception().unwrap().unwrap();
        assert_eq!(exception.message(), "gate jammed");
        assert_eq!(exception.info().source.as_deref(), Some("Demo.Gate.Fail"));
    }

    #[test]
    fn test_async_static_operation() {
        let (app, _open) = gated_app();
        let token = Async::new();
        let result = app
            .static_operation("Demo.Gate.Echo")
            .unwrap()
            .call(&args![&token, "hello"])
            .unwrap();
        async_io::block_on(token.completion()).unwrap();
        assert_eq!(result.value::<String>().unwrap(), "hello");
    }

    #[test]
    fn test_token_serves_one_call() {
        let (app, _open) = gated_app();
        let token = Async::new();
        app.static_operation("Demo.Gate.Echo")
            .unwrap()
            .call(&args![1, &token])
            .unwrap();

        assert_matches!(
            app.static_operation("Demo.Gate.Echo").unwrap().with_async(&token),
            Err(Error::AsyncAlreadyUsed)
        );
        assert_matches!(
            app.static_operation("Demo.Gate.Echo").unwrap().call(&args![&token]),
            Err(Error::AsyncAlreadyUsed)
        );
        assert_matches!(token.complete_externally(), Err(Error::InvalidCompletion));
    }

    #[test]
    fn test_token_on_builder_and_in_arguments() {
        let (app, sent) = counting_app();
        let list = app.declare_value(&vec![1]).unwrap();
        let token = Async::new();
        let before = sent.get();

        let operation = list.operation("Count").with_async(&token).unwrap();
        assert_matches!(
            operation.call(&args![&token]),
            Err(Error::DuplicateArgument(TokenKind::Async))
        );
        assert_eq!(sent.get(), before);
    }

    #[test]
    fn test_usage_errors_send_nothing_and_keep_the_token() {
        let (app, sent) = counting_app();
        let counter = app.construct("Demo.Counter", &[]).unwrap();
        let released = app.construct("Demo.Counter", &[]).unwrap();
        released.release();
        let foreign = LocalExecutor::new().app().declare_value(&1).unwrap();
        let token = Async::with_poll_interval(Duration::from_millis(1));
        let before = sent.get();

        assert_matches!(
            released.operation("Increment").call(&args![&token]),
            Err(Error::Released)
        );
        assert_matches!(
            counter.operation("Increment").call(&[
                Arg::from(&token),
                Arg::from(1),
                Arg::TypeRef("Demo.Counter".to_owned()),
            ]),
            Err(Error::TypeReferenceArgument { index: 2, .. })
        );
        assert_matches!(
            counter.operation("Increment").call(&args![&foreign, &token]),
            Err(Error::DifferentConnection { index: 1 })
        );
        assert_eq!(sent.get(), before);
        assert!(!token.is_completed().unwrap());

        let bound = Async::new();
        let increment = counter.operation("Increment").with_async(&bound).unwrap();
        assert_matches!(increment.call(&args![&foreign]), Err(Error::DifferentConnection { .. }));
        assert_eq!(sent.get(), before);
        assert_matches!(bound.complete_externally(), Err(Error::InvalidCompletion));

        counter.operation("Increment").call(&args![&token]).unwrap();
        token.wait_for_completion().unwrap();
        increment.call(&[]).unwrap();
        bound.wait_for_completion().unwrap();
        assert_eq!(counter.value::<i64>().unwrap(), 2);
    }

    #[test]
    fn test_concurrent_calls_submit_once() {
        let (app, sent) = counting_app();
        let counter = app.construct("Demo.Counter", &[]).unwrap();
        let token = Async::with_poll_interval(Duration::from_millis(1));
        let increment = counter.operation("Increment").with_async(&token).unwrap();
        let before = sent.get();

        let barrier = Barrier::new(4);
        let results: Vec<Result<AppVar>> = thread::scope(|s| {
            let calls: Vec<_> = (0..4)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        increment.call(&[])
                    })
                })
                .collect();
            calls.into_iter().map(|call| call.join().unwrap()).collect()
        });

        // Result slot allocation plus the call itself.
        assert_eq!(sent.get(), before + 2);
        assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
        for result in results.iter().filter(|result| result.is_err()) {
            assert_matches!(result, Err(Error::AsyncAlreadyUsed));
        }

        token.wait_for_completion().unwrap();
        assert_eq!(counter.value::<i64>().unwrap(), 1);
    }

    #[test]
    fn test_external_completion() {
        let token = Async::new();
        assert!(!token.is_completed().unwrap());
        token.complete_externally().unwrap();
        assert!(token.is_completed().unwrap());
        assert_eq!(token.executing_exception().unwrap(), None);
        token.wait_for_completion().unwrap();

        assert_matches!(token.complete_externally(), Err(Error::InvalidCompletion));
        assert_matches!(token.bind(), Err(Error::AsyncAlreadyUsed));
    }

    #[test]
    fn test_bound_token_cannot_complete_externally() {
        let token = Async::new();
        token.bind().unwrap();
        assert_matches!(token.complete_externally(), Err(Error::InvalidCompletion));
        assert!(!token.is_completed().unwrap());
    }

    #[test]
    fn test_failed_submission_completes_the_token() {
        let (app, _open) = gated_app();
        let token = Async::new();
        let err = app
            .static_operation("Demo.Missing.Echo")
            .unwrap()
            .call(&args![&token])
            .unwrap_err();
        assert_matches!(err, Error::Remote(_));
        assert!(token.is_completed().unwrap());
        assert_eq!(token.executing_exception().unwrap(), None);
    }

    #[test]
    fn test_poll_interval() {
        assert_eq!(Async::new().poll_interval(), Duration::from_millis(10));
        assert_eq!(
            Async::with_poll_interval(Duration::from_millis(2)).poll_interval(),
            Duration::from_millis(2)
        );
    }
}
