/// Registration progress.
///
/// Pending outcomes only ever advance along
/// `INIT -> CONNECT -> SUBSCRIBE -> REQUEST -> WAITING_FOR_RESPONSE`, with
/// the waiting state looping back to `REQUEST` while the service keeps the
/// operation open. Success jumps to `DONE` and any failure to `ERROR` from
/// whichever state the failure was observed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Init,
    Connect,
    Subscribe,
    Request,
    WaitingForResponse,
    Done,
    Error,
}

impl State {
    pub(crate) fn is_terminal(self) -> bool {
        matches!(self, State::Done | State::Error)
    }

    /// True while the protocol is running: past INIT, not yet terminal.
    pub(crate) fn is_in_progress(self) -> bool {
        matches!(
            self,
            State::Connect | State::Subscribe | State::Request | State::WaitingForResponse
        )
    }

    /// The state a pending outcome advances to, if the current state has
    /// one.
    pub(crate) fn advanced(self) -> Option<State> {
        match self {
            State::Init => Some(State::Connect),
            State::Connect => Some(State::Subscribe),
            State::Subscribe => Some(State::Request),
            State::Request => Some(State::WaitingForResponse),
            State::WaitingForResponse => Some(State::Request),
            State::Done | State::Error => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_transitions_follow_the_table() {
        assert_eq!(State::Init.advanced(), Some(State::Connect));
        assert_eq!(State::Connect.advanced(), Some(State::Subscribe));
        assert_eq!(State::Subscribe.advanced(), Some(State::Request));
        assert_eq!(State::Request.advanced(), Some(State::WaitingForResponse));
        assert_eq!(State::WaitingForResponse.advanced(), Some(State::Request));
        assert_eq!(State::Done.advanced(), None);
        assert_eq!(State::Error.advanced(), None);
    }

    #[test]
    fn progress_classification() {
        assert!(!State::Init.is_in_progress());
        assert!(State::Connect.is_in_progress());
        assert!(State::WaitingForResponse.is_in_progress());
        assert!(!State::Done.is_in_progress());
        assert!(State::Done.is_terminal());
        assert!(State::Error.is_terminal());
        assert!(!State::Init.is_terminal());
    }
}
