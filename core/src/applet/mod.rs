//! Applets: endpoints driven by the scheduler directly instead of a socket
//! (spec.md §6). An applet's producer/consumer role is identical to a
//! backend server's from the [`StreamInterface`](crate::si::StreamInterface)'s
//! point of view — it just never touches a file descriptor.

pub mod peer;
pub mod stats;

use crate::channel::Channel;
use crate::clock::Tick;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppletResult {
    /// made progress; caller may call `process` again immediately.
    Progress,
    /// output channel is full or input is empty: wait for the next wakeup.
    Suspend,
    /// the applet has nothing further to do and may be torn down.
    Done,
}

/// A cooperative handler the scheduler invokes in place of socket IO.
/// `input` carries bytes the applet's "client" produced (its command line,
/// its half of a peer handshake); `output` is where the applet writes its
/// response.
pub trait Applet {
    fn process(&mut self, input: &mut Channel, output: &mut Channel, now: Tick) -> AppletResult;
}
