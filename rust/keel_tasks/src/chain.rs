//! Staged tasks with cooperative yield points.
//!
//! A [`Chain`] is a sequence of phases where each phase consumes the result
//! of its predecessor; the first phase starts from the unit value. Between
//! phases the chain polls a [`RequestProxy`] and yields with a
//! [`ServiceToken`] when asked to cancel, suspend or be preempted. The
//! scheduler keeps calling [`Chain::resume`] until every phase has run and
//! then publishes the final value.
//!
//! Composition is type-checked at the builder seam ([`Chain::then`]
//! requires each phase to consume the previous result type); storage is
//! homogenised so a chain of arbitrary phase types stays one object.

use keel::future::{
    CancelRequest, PreemptRequest, RequestProxy, RequestType, ServiceToken, SuspendRequest,
};
use std::any::Any;
use std::fmt::{self, Debug, Formatter};
use std::marker::PhantomData;

/// Maximum number of phases in a chain. The two top values of the phase
/// index are reserved.
pub const MAX_PHASES: usize = (u8::MAX - 2) as usize;

/// The value flowing between phases, homogenised over all phase result
/// types.
pub type ChainStack = Box<dyn Any + Send>;

/// A fresh stack holding the unit value, ready for phase 0.
pub fn empty_stack() -> ChainStack {
    Box::new(())
}

type Phase = Box<dyn FnMut(ChainStack) -> ChainStack + Send>;

/// Resumption state of a chain: the next phase to run, and why the last
/// resume stopped early (if it did).
#[derive(Debug, Default, Copy, Clone)]
pub struct ChainState {
    /// Index of the next phase to execute. Equal to the phase count once
    /// the chain has completed.
    pub next_phase_index: u8,
    /// The request observed at the cooperation point that stopped the last
    /// resume, if any.
    pub service_token: Option<ServiceToken>,
}

/// A compile-time-composed sequence of phases producing an `R`.
pub struct Chain<R> {
    phases: Vec<Phase>,
    _result: PhantomData<fn() -> R>,
}

impl<R: Send + 'static> Chain<R> {
    /// Starts a chain with its first phase.
    pub fn new(mut f: impl FnMut() -> R + Send + 'static) -> Self {
        Self {
            phases: vec![Box::new(move |_| Box::new(f()))],
            _result: PhantomData,
        }
    }

    /// Appends a phase consuming this chain's result type.
    ///
    /// # Panics
    ///
    /// Panics if the chain already holds [`MAX_PHASES`] phases. The
    /// [`chain!`](crate::chain!) macro checks the bound at compile time.
    pub fn then<U: Send + 'static>(
        mut self,
        mut f: impl FnMut(R) -> U + Send + 'static,
    ) -> Chain<U> {
        assert!(
            self.phases.len() < MAX_PHASES,
            "chain depth is limited to {MAX_PHASES} phases"
        );

        self.phases.push(Box::new(move |stack| {
            let arg = stack
                .downcast::<R>()
                .expect("chain stack carries the previous phase result");
            Box::new(f(*arg))
        }));

        Chain {
            phases: self.phases,
            _result: PhantomData,
        }
    }

    /// Number of phases in the chain.
    pub fn num_phases(&self) -> usize {
        self.phases.len()
    }

    /// Executes phases starting at `state.next_phase_index`, polling `proxy`
    /// between phases. On a cancel, suspend or preempt request the chain
    /// stops and records the corresponding [`ServiceToken`]; otherwise it
    /// runs to completion.
    pub fn resume(&mut self, stack: &mut ChainStack, state: &mut ChainState, proxy: &RequestProxy) {
        state.service_token = None;

        while (state.next_phase_index as usize) < self.phases.len() {
            let index = state.next_phase_index as usize;
            let arg = std::mem::replace(stack, Box::new(()));
            *stack = (self.phases[index])(arg);
            state.next_phase_index += 1;

            if (state.next_phase_index as usize) == self.phases.len() {
                return;
            }

            // cooperation point
            if proxy.fetch_cancel_request() == CancelRequest::Canceled {
                state.service_token = Some(ServiceToken(RequestType::Cancel));
                return;
            }

            if proxy.fetch_suspend_request() == SuspendRequest::Suspended {
                state.service_token = Some(ServiceToken(RequestType::Suspend));
                return;
            }

            if proxy.fetch_preempt_request() == PreemptRequest::Preempted {
                state.service_token = Some(ServiceToken(RequestType::Preempt));
                return;
            }
        }
    }

    /// Unwraps the final value after the last phase has run.
    pub fn into_result(stack: ChainStack) -> R {
        *stack
            .downcast::<R>()
            .expect("chain stack holds the final phase result")
    }
}

impl<R> Debug for Chain<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain").field("num_phases", &self.phases.len()).finish_non_exhaustive()
    }
}

/// Builds a [`Chain`] from a list of phases, checking the depth bound at
/// compile time.
///
/// ```
/// use keel_tasks::chain;
///
/// let chain = chain![|| 1, |x: i32| x + 2, |x: i32| x * 10];
/// assert_eq!(chain.num_phases(), 3);
/// ```
#[macro_export]
macro_rules! chain {
    ($first:expr $(, $rest:expr)* $(,)?) => {{
        const PHASES: usize = 1usize $(+ $crate::__chain_one!($rest))*;
        const _: () = assert!(
            PHASES <= $crate::chain::MAX_PHASES,
            "chain depth is limited to 253 phases"
        );
        $crate::chain::Chain::new($first)$(.then($rest))*
    }};
}

#[doc(hidden)]
#[macro_export]
macro_rules! __chain_one {
    ($phase:expr) => {
        1usize
    };
}
