use pin_project::pin_project;
use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::thread;

/// Type-erased task body plus storage for its eventual result.
pub(crate) trait Payload: Send {
    /// Polls the body. A panic is caught and stored as the result.
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()>;

    /// Drops the body without producing a result.
    fn drop_future(self: Pin<&mut Self>);

    /// Moves the stored result into `dst`, which must be an
    /// `Option<thread::Result<T>>` for the body's output type `T`.
    fn take_output(self: Pin<&mut Self>, dst: &mut dyn Any);
}

#[pin_project(project = StageProj, project_replace = StageOwn)]
enum Stage<F: Future> {
    Running(#[pin] F),
    Finished(thread::Result<F::Output>),
    Consumed,
}

#[pin_project]
pub(crate) struct WrappedCall<F: Future> {
    #[pin]
    stage: Stage<F>,
}

impl<F: Future> WrappedCall<F> {
    pub(crate) fn new(future: F) -> Self {
        Self {
            stage: Stage::Running(future),
        }
    }
}

impl<F> Payload for WrappedCall<F>
where
    F: Future + Send,
    F::Output: Send + 'static,
{
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut stage = self.project().stage;

        let res = match stage.as_mut().project() {
            StageProj::Running(fut) => panic::catch_unwind(AssertUnwindSafe(|| fut.poll(cx))),
            _ => unreachable!("task body polled after completion"),
        };

        match res {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(output)) => {
                stage.set(Stage::Finished(Ok(output)));
                Poll::Ready(())
            }
            Err(panic) => {
                stage.set(Stage::Finished(Err(panic)));
                Poll::Ready(())
            }
        }
    }

    fn drop_future(self: Pin<&mut Self>) {
        let mut stage = self.project().stage;
        if matches!(stage.as_mut().project(), StageProj::Running(_)) {
            stage.set(Stage::Consumed);
        }
    }

    fn take_output(self: Pin<&mut Self>, dst: &mut dyn Any) {
        let Some(slot) = dst.downcast_mut::<Option<thread::Result<F::Output>>>() else {
            unreachable!("task output requested with a mismatched type");
        };

        let stage = self.project().stage;
        match stage.project_replace(Stage::Consumed) {
            StageOwn::Finished(res) => *slot = Some(res),
            StageOwn::Running(_) => unreachable!("task output requested before completion"),
            StageOwn::Consumed => {}
        }
    }
}
