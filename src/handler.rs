use crate::sighting::Sighting;
use crossbeam_channel::Sender;

/// Receives every sighting the supervisor produces.
///
/// Runs inline on the supervisor's dispatch thread: while `handle` runs no further bus
/// events are dispatched, and a panic ends the dispatch loop. Slow consumers should hand
/// off, e.g. through [`ChannelHandler`].
pub trait SightingHandler: Send + 'static {
    fn handle(&mut self, sighting: Sighting);
}

impl<F> SightingHandler for F
where
    F: FnMut(Sighting) + Send + 'static,
{
    fn handle(&mut self, sighting: Sighting) {
        self(sighting)
    }
}

/// Forwards sightings to another thread
#[derive(Clone)]
pub struct ChannelHandler {
    sender: Sender<Sighting>,
}

impl ChannelHandler {
    pub fn new(sender: Sender<Sighting>) -> Self {
        Self { sender }
    }
}

impl SightingHandler for ChannelHandler {
    fn handle(&mut self, sighting: Sighting) {
        if let Err(why) = self.sender.send(sighting) {
            log::warn!("Could not forward sighting of {}: receiver closed", why.0.address);
        }
    }
}
