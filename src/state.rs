//! The per-handle state enumeration.
//!
//! States are grouped two levels deep: a top-level group (connecting,
//! handshake magic, newstyle option, transmission issue/reply) and a
//! substate within it. Each substate is the unit of resumability: the
//! engine can return to the caller from any of them and pick up at the
//! exact same byte offset later.

/// Socket readiness the engine is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    None,
    Read,
    Write,
    Both,
}

impl Direction {
    pub fn wants_read(&self) -> bool {
        matches!(self, Direction::Read | Direction::Both)
    }

    pub fn wants_write(&self) -> bool {
        matches!(self, Direction::Write | Direction::Both)
    }

    pub(crate) fn union(self, other: Direction) -> Direction {
        match (self.wants_read() || other.wants_read(), self.wants_write() || other.wants_write())
        {
            (true, true) => Direction::Both,
            (true, false) => Direction::Read,
            (false, true) => Direction::Write,
            (false, false) => Direction::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectState {
    Start,
    Connecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TcpConnectState {
    Start,
    Connect,
    Connecting,
    NextAddress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MagicState {
    Start,
    RecvMagic,
    CheckMagic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OldstyleState {
    Start,
    RecvRemaining,
    Check,
}

/// The canonical substate cycle every newstyle option goes through: build
/// the request, send it, read the reply header, read the reply payload,
/// interpret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OptState {
    Start,
    Send,
    RecvReply,
    RecvReplyPayload,
    CheckReply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NewstyleState {
    Start,
    RecvGflags,
    CheckGflags,
    SendCflags,
    OptStartTls(OptState),
    TlsHandshakeRead,
    TlsHandshakeWrite,
    TlsHandshakeDone,
    OptStructuredReply(OptState),
    /// Serves both SET and LIST of metadata contexts; the current option
    /// code on the handle picks which.
    OptMetaContext(OptState),
    /// Serves both GO and INFO.
    OptGo(OptState),
    OptExportName(OptState),
    OptList(OptState),
    PrepareOptAbort,
    OptAbort(OptState),
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IssueState {
    Start,
    SendRequest,
    PauseSendRequest,
    PrepareWritePayload,
    SendWritePayload,
    PauseWritePayload,
    SendWriteShutdown,
    PauseWriteShutdown,
    Finish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SimpleReplyState {
    Start,
    RecvReadPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StructuredReplyState {
    Start,
    RecvRemaining,
    Check,
    RecvError,
    RecvErrorMessage,
    RecvErrorTail,
    RecvOffsetData,
    RecvOffsetDataData,
    RecvOffsetHole,
    RecvBsEntries,
    /// Consume any remaining (skipped) payload bytes, then account the
    /// chunk.
    Finish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplyState {
    Start,
    RecvReply,
    CheckSimpleOrStructured,
    Simple(SimpleReplyState),
    Structured(StructuredReplyState),
    FinishCommand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Created,
    Connecting(ConnectState),
    ConnectingTcp(TcpConnectState),
    Magic(MagicState),
    Oldstyle(OldstyleState),
    Newstyle(NewstyleState),
    Negotiating,
    Ready,
    Issue(IssueState),
    Reply(ReplyState),
    Closed,
    Dead,
}

impl State {
    /// The readiness this state blocks on. Internal (non-blocking) states
    /// report `None`; the engine never rests in them.
    pub fn direction(&self) -> Direction {
        use Direction::*;
        match self {
            State::Created | State::Negotiating | State::Closed | State::Dead => None,
            State::Connecting(s) => match s {
                ConnectState::Start => None,
                ConnectState::Connecting => Write,
            },
            State::ConnectingTcp(s) => match s {
                TcpConnectState::Start | TcpConnectState::Connect | TcpConnectState::NextAddress => {
                    None
                }
                TcpConnectState::Connecting => Write,
            },
            State::Magic(s) => match s {
                MagicState::Start | MagicState::CheckMagic => None,
                MagicState::RecvMagic => Read,
            },
            State::Oldstyle(s) => match s {
                OldstyleState::Start | OldstyleState::Check => None,
                OldstyleState::RecvRemaining => Read,
            },
            State::Newstyle(s) => match s {
                NewstyleState::Start | NewstyleState::CheckGflags => None,
                NewstyleState::RecvGflags => Read,
                NewstyleState::SendCflags => Write,
                NewstyleState::TlsHandshakeRead => Read,
                NewstyleState::TlsHandshakeWrite => Write,
                NewstyleState::TlsHandshakeDone => None,
                NewstyleState::PrepareOptAbort | NewstyleState::Finished => None,
                NewstyleState::OptStartTls(o)
                | NewstyleState::OptStructuredReply(o)
                | NewstyleState::OptMetaContext(o)
                | NewstyleState::OptGo(o)
                | NewstyleState::OptExportName(o)
                | NewstyleState::OptList(o)
                | NewstyleState::OptAbort(o) => match o {
                    OptState::Start | OptState::CheckReply => None,
                    OptState::Send => Write,
                    OptState::RecvReply | OptState::RecvReplyPayload => Read,
                },
            },
            // Transmission: READY watches for replies; a blocked send also
            // watches for reads so an incoming reply can preempt it.
            State::Ready => Read,
            State::Issue(s) => match s {
                IssueState::SendRequest
                | IssueState::SendWritePayload
                | IssueState::SendWriteShutdown => Both,
                _ => None,
            },
            State::Reply(s) => match s {
                ReplyState::CheckSimpleOrStructured | ReplyState::FinishCommand => None,
                ReplyState::Simple(SimpleReplyState::Start) => None,
                ReplyState::Structured(StructuredReplyState::Start)
                | ReplyState::Structured(StructuredReplyState::Check) => None,
                _ => Read,
            },
        }
    }

    /// Connected means a transport exists and neither terminal state has
    /// been reached.
    pub fn is_connected(&self) -> bool {
        !matches!(self, State::Created | State::Closed | State::Dead)
    }

    /// Transmission phase: commands may be queued.
    pub fn in_transmission(&self) -> bool {
        matches!(self, State::Ready | State::Issue(_) | State::Reply(_))
    }

    pub fn is_connecting(&self) -> bool {
        self.is_connected() && !self.in_transmission() && !matches!(self, State::Negotiating)
    }
}
