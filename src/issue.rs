//! Issue-side transmission states: move commands from the issue queue
//! onto the wire.
//!
//! A send blocked mid-frame can be preempted by an incoming reply (the
//! Pause states); the write position survives the jaunt through the reply
//! engine and the send resumes at the exact byte it stopped at.

use crate::errors::{Error, Result};
use crate::handle::{Flow, Handle, SendSource};
use crate::proto::{Cmd, COALESCE_LIMIT, REQUEST_MAGIC, REQUEST_SIZE};
use crate::state::{IssueState, ReplyState, State};

impl Handle {
    pub(crate) fn step_issue(&mut self, s: IssueState) -> Result<Flow> {
        match s {
            IssueState::Start => self.issue_start(),
            IssueState::SendRequest => {
                if self.send_from_wbuf()? {
                    self.state = State::Issue(IssueState::PrepareWritePayload);
                    Ok(Flow::Continue)
                } else {
                    Ok(Flow::Block)
                }
            }
            IssueState::PauseSendRequest => {
                self.in_write_payload = false;
                self.state = State::Reply(ReplyState::Start);
                Ok(Flow::Continue)
            }
            IssueState::PrepareWritePayload => self.prepare_write_payload(),
            IssueState::SendWritePayload => {
                if self.send_from_wbuf()? {
                    self.state = State::Issue(IssueState::Finish);
                    Ok(Flow::Continue)
                } else {
                    Ok(Flow::Block)
                }
            }
            IssueState::PauseWritePayload => {
                self.in_write_payload = true;
                self.state = State::Reply(ReplyState::Start);
                Ok(Flow::Continue)
            }
            IssueState::SendWriteShutdown => {
                let conn = self
                    .conn
                    .as_mut()
                    .ok_or_else(|| Error::not_connected("no transport"))?;
                match conn.shut_writes() {
                    Ok(true) => {
                        self.in_write_shutdown = false;
                        self.state = State::Issue(IssueState::Finish);
                        Ok(Flow::Continue)
                    }
                    Ok(false) => Ok(Flow::Block),
                    Err(e) => Err(Error::io(e, "shutting down writes")),
                }
            }
            IssueState::PauseWriteShutdown => {
                self.state = State::Reply(ReplyState::Start);
                Ok(Flow::Continue)
            }
            IssueState::Finish => self.issue_finish(),
        }
    }

    fn issue_start(&mut self) -> Result<Flow> {
        let Some(cmd) = self.cmds_to_issue.front() else {
            self.state = State::Ready;
            return Ok(Flow::Continue);
        };

        // Were we interrupted by reading a reply to an earlier command?
        // If so we got back here through the reply engine and the socket
        // is unlikely to be writable yet: restore the paused substate
        // without attempting a send.
        if self.in_write_shutdown {
            self.state = State::Issue(IssueState::SendWriteShutdown);
            return Ok(Flow::Block);
        }
        if self.wpos < self.wlen {
            self.state = State::Issue(if self.in_write_payload {
                IssueState::SendWritePayload
            } else {
                IssueState::SendRequest
            });
            return Ok(Flow::Block);
        }

        let mut header = [0u8; REQUEST_SIZE];
        header[0..4].copy_from_slice(&REQUEST_MAGIC.to_be_bytes());
        header[4..6].copy_from_slice(&cmd.flags.bits().to_be_bytes());
        header[6..8].copy_from_slice(&u16::from(cmd.typ).to_be_bytes());
        header[8..16].copy_from_slice(&cmd.cookie.to_be_bytes());
        header[16..24].copy_from_slice(&cmd.offset.to_be_bytes());
        header[24..28].copy_from_slice(&cmd.count.to_be_bytes());
        self.request = header;
        self.wsource = SendSource::Request;
        self.wpos = 0;
        self.wlen = REQUEST_SIZE;
        self.wmore = cmd.typ == Cmd::WRITE || self.cmds_to_issue.len() > 1;
        self.state = State::Issue(IssueState::SendRequest);
        Ok(Flow::Continue)
    }

    fn prepare_write_payload(&mut self) -> Result<Flow> {
        let Some(cmd) = self.cmds_to_issue.front() else {
            return Err(Error::protocol("issue queue emptied mid-command"));
        };
        match cmd.typ {
            Cmd::WRITE => {
                self.wsource = SendSource::Payload;
                self.wpos = 0;
                self.wlen = cmd.buf.len();
                self.wmore = self.cmds_to_issue.len() > 1 && self.wlen < COALESCE_LIMIT;
                self.state = State::Issue(IssueState::SendWritePayload);
            }
            Cmd::DISC => {
                self.in_write_shutdown = true;
                self.state = State::Issue(IssueState::SendWriteShutdown);
            }
            _ => {
                self.state = State::Issue(IssueState::Finish);
            }
        }
        Ok(Flow::Continue)
    }

    fn issue_finish(&mut self) -> Result<Flow> {
        let cmd = self
            .cmds_to_issue
            .pop_front()
            .ok_or_else(|| Error::protocol("issue queue emptied mid-command"))?;
        if cmd.typ == Cmd::DISC {
            // no reply will ever arrive for a disconnect; retire it on
            // the spot
            drop(cmd);
        } else {
            self.cmds_in_flight.push_back(cmd);
        }
        self.in_write_payload = false;
        self.state = State::Ready;
        Ok(Flow::Continue)
    }
}
