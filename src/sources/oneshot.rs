//! Single-shot event subscriptions
//!
//! [`OneShot`] wraps any event source so that its callback gets to *consume* the
//! registration: as soon as the callback returns [`Delivery::Consumed`], no further event is
//! passed to it and the source is removed from the event loop. Events the callback returns
//! [`Delivery::Ignored`] for leave the registration in place.

use calloop::{EventSource, Poll, PostAction, Readiness, Token, TokenFactory};

/// What a [`OneShot`] callback did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The event was handled, remove the registration
    Consumed,
    /// The event was not for us, keep waiting
    Ignored,
}

/// An event source that removes itself after the first consumed event
#[derive(Debug)]
pub struct OneShot<S> {
    inner: S,
    consumed: bool,
}

impl<S> OneShot<S> {
    /// Wraps `inner` into a single-shot source
    pub fn new(inner: S) -> OneShot<S> {
        OneShot { inner, consumed: false }
    }

    /// Whether the subscription has been consumed already
    pub fn is_consumed(&self) -> bool {
        self.consumed
    }

    /// Access the wrapped source
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }
}

impl<S> EventSource for OneShot<S>
where
    S: EventSource<Ret = ()>,
{
    type Event = S::Event;
    type Metadata = S::Metadata;
    type Ret = Delivery;
    type Error = S::Error;

    fn process_events<F>(
        &mut self,
        readiness: Readiness,
        token: Token,
        mut callback: F,
    ) -> Result<PostAction, Self::Error>
    where
        F: FnMut(Self::Event, &mut Self::Metadata) -> Self::Ret,
    {
        let consumed = &mut self.consumed;
        let action = self.inner.process_events(readiness, token, |event, meta| {
            // events batched after the consuming one are dropped
            if !*consumed && callback(event, meta) == Delivery::Consumed {
                *consumed = true;
            }
        })?;

        if self.consumed {
            Ok(PostAction::Remove)
        } else {
            Ok(action)
        }
    }

    fn register(&mut self, poll: &mut Poll, token_factory: &mut TokenFactory) -> calloop::Result<()> {
        self.inner.register(poll, token_factory)
    }

    fn reregister(&mut self, poll: &mut Poll, token_factory: &mut TokenFactory) -> calloop::Result<()> {
        self.inner.reregister(poll, token_factory)
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        self.inner.unregister(poll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calloop::{channel, ping::make_ping, EventLoop};
    use std::time::Duration;

    #[test]
    fn fires_once() {
        let mut event_loop = EventLoop::<u32>::try_new().unwrap();
        let (ping, source) = make_ping().unwrap();
        event_loop
            .handle()
            .insert_source(OneShot::new(source), |(), _, count| {
                *count += 1;
                Delivery::Consumed
            })
            .unwrap();

        let mut count = 0;
        ping.ping();
        event_loop
            .dispatch(Some(Duration::from_millis(100)), &mut count)
            .unwrap();
        assert_eq!(count, 1);

        // the registration is gone, a second ping goes nowhere
        ping.ping();
        event_loop
            .dispatch(Some(Duration::from_millis(100)), &mut count)
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn ignored_events_keep_the_registration() {
        let mut event_loop = EventLoop::<Vec<u32>>::try_new().unwrap();
        let (sender, source) = channel::channel::<u32>();
        event_loop
            .handle()
            .insert_source(OneShot::new(source), |event, _, seen| match event {
                channel::Event::Msg(n) => {
                    seen.push(n);
                    if n == 2 {
                        Delivery::Consumed
                    } else {
                        Delivery::Ignored
                    }
                }
                channel::Event::Closed => Delivery::Ignored,
            })
            .unwrap();

        let mut seen = Vec::new();
        // 3 is batched behind the consuming event and never delivered
        for n in [1, 2, 3] {
            sender.send(n).unwrap();
        }
        event_loop
            .dispatch(Some(Duration::from_millis(100)), &mut seen)
            .unwrap();
        assert_eq!(seen, vec![1, 2]);

        // the receiving end went away with the source
        let _ = sender.send(4);
        event_loop
            .dispatch(Some(Duration::from_millis(100)), &mut seen)
            .unwrap();
        assert_eq!(seen, vec![1, 2]);
    }
}
