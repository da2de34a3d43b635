//! Reply stream decoding.
//!
//! After the request is sent the daemon streams `NNN <text>\n` lines until it
//! closes the connection. Each line's numeric prefix decides what happens:
//!
//! | Class | Action |
//! |---|---|
//! | comment / raw / log / informational | echo text |
//! | success | echo text, status = 0 |
//! | enter-secret / user-prompt | prompt (once), write credential back, status = 0 |
//! | anything else | echo text, status = code |
//!
//! A line without a numeric prefix aborts the transaction.

use std::io::{Read, Write};

use tracing::{error, trace, warn};

use crate::credentials::{CredentialBridge, CredentialSource};
use crate::error::{CredentialKind, Result, WhackError};
use crate::transport::Connection;

/// Reply codes of the daemon ABI.
pub mod rc {
    pub const COMMENT: u32 = 0;
    pub const RAW: u32 = 1;
    pub const LOG: u32 = 2;
    pub const LOG_SERIOUS: u32 = 3;
    pub const SUCCESS: u32 = 4;
    pub const INFORMATIONAL: u32 = 5;
    pub const DUPNAME: u32 = 20;
    pub const UNKNOWN_NAME: u32 = 21;
    pub const WHACK_PROBLEM: u32 = 29;
    pub const ENTERSECRET: u32 = 40;
    pub const USERPROMPT: u32 = 41;
}

/// Longest reply line accepted, newline included.
pub const MAX_LINE_LEN: usize = 4096;

/// The codes that get special treatment; every other code is a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyCodes {
    pub comment: u32,
    pub raw: u32,
    pub log: u32,
    pub informational: u32,
    pub success: u32,
    pub enter_secret: u32,
    pub user_prompt: u32,
}

impl Default for ReplyCodes {
    fn default() -> Self {
        Self {
            comment: rc::COMMENT,
            raw: rc::RAW,
            log: rc::LOG,
            informational: rc::INFORMATIONAL,
            success: rc::SUCCESS,
            enter_secret: rc::ENTERSECRET,
            user_prompt: rc::USERPROMPT,
        }
    }
}

/// What a reply code asks the client to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyClass {
    /// Progress output; no effect on the status.
    Chatter,
    Success,
    EnterSecret,
    UserPrompt,
    /// A daemon-assigned result.
    Status(i32),
}

impl ReplyCodes {
    pub fn classify(&self, code: u32) -> ReplyClass {
        if [self.comment, self.raw, self.log, self.informational].contains(&code) {
            ReplyClass::Chatter
        } else if code == self.success {
            ReplyClass::Success
        } else if code == self.enter_secret {
            ReplyClass::EnterSecret
        } else if code == self.user_prompt {
            ReplyClass::UserPrompt
        } else {
            // parse() keeps codes within i32
            ReplyClass::Status(i32::try_from(code).unwrap_or(i32::MAX))
        }
    }
}

/// One reply line split into its code and payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyLine<'a> {
    pub code: u32,
    /// Text after `"NNN "`, newline included.
    pub payload: &'a [u8],
}

impl<'a> ReplyLine<'a> {
    /// Split `line` into code and payload. The prefix is one or more ASCII
    /// digits followed by exactly one space; anything else, or a code above
    /// `i32::MAX`, is a protocol violation.
    pub fn parse(line: &'a [u8]) -> Result<Self> {
        let digits = line.iter().take_while(|b| b.is_ascii_digit()).count();
        if digits == 0 || line.get(digits) != Some(&b' ') {
            return Err(violation(line));
        }

        let mut code: u32 = 0;
        for b in &line[..digits] {
            code = code
                .checked_mul(10)
                .and_then(|c| c.checked_add(u32::from(b - b'0')))
                .filter(|c| i32::try_from(*c).is_ok())
                .ok_or_else(|| violation(line))?;
        }

        Ok(Self {
            code,
            payload: &line[digits + 1..],
        })
    }

    /// Payload without its line terminator, for prompts and logs.
    pub fn text(&self) -> String {
        let p = self.payload.strip_suffix(b"\n").unwrap_or(self.payload);
        String::from_utf8_lossy(p).into_owned()
    }
}

fn violation(line: &[u8]) -> WhackError {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    WhackError::ProtocolViolation {
        line: String::from_utf8_lossy(line).into_owned(),
    }
}

/// How a reply stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyOutcome {
    /// Last recorded status; 0 if only chatter and success were seen.
    pub status: i32,
    /// The stream closed in the middle of a line (or the line overran
    /// [`MAX_LINE_LEN`]).
    pub incomplete_final_line: bool,
}

/// Drives one reply stream to completion.
pub struct ReplyReader<'a, W: ?Sized, P: ?Sized> {
    codes: ReplyCodes,
    transcript: &'a mut W,
    bridge: CredentialBridge<'a, P>,
    status: i32,
}

impl<'a, W, P> ReplyReader<'a, W, P>
where
    W: Write + ?Sized,
    P: CredentialSource + ?Sized,
{
    pub fn new(codes: ReplyCodes, transcript: &'a mut W, bridge: CredentialBridge<'a, P>) -> Self {
        Self {
            codes,
            transcript,
            bridge,
            status: 0,
        }
    }

    /// Read, classify and answer lines until the daemon closes `conn`.
    pub fn run<S: Read + Write>(mut self, conn: &mut Connection<S>) -> Result<ReplyOutcome> {
        let mut buf = vec![0u8; MAX_LINE_LEN];
        let mut filled = 0;
        let mut incomplete_final_line = false;

        loop {
            if filled == buf.len() {
                warn!(len = filled, "whack: last line from daemon too long or unterminated");
                incomplete_final_line = true;
                break;
            }

            let n = conn
                .recv_chunk(&mut buf[filled..])
                .map_err(WhackError::Read)?;
            if n == 0 {
                if filled > 0 {
                    warn!(len = filled, "whack: last line from daemon too long or unterminated");
                    incomplete_final_line = true;
                }
                break;
            }
            filled += n;

            let mut start = 0;
            while let Some(pos) = buf[start..filled].iter().position(|b| *b == b'\n') {
                let end = start + pos + 1;
                self.handle_line(&buf[start..end], conn)?;
                start = end;
            }
            buf.copy_within(start..filled, 0);
            filled -= start;
        }

        Ok(ReplyOutcome {
            status: self.status,
            incomplete_final_line,
        })
    }

    fn handle_line<S: Read + Write>(&mut self, raw: &[u8], conn: &mut Connection<S>) -> Result<()> {
        let line = ReplyLine::parse(raw)?;
        let class = self.codes.classify(line.code);
        trace!(code = line.code, ?class, "reply line");

        match class {
            ReplyClass::Chatter => self.echo(line.payload),
            ReplyClass::Success => {
                self.echo(line.payload);
                self.status = 0;
            }
            ReplyClass::EnterSecret => self.answer(CredentialKind::Secret, &line, conn)?,
            ReplyClass::UserPrompt => self.answer(CredentialKind::Username, &line, conn)?,
            ReplyClass::Status(code) => {
                self.echo(line.payload);
                self.status = code;
            }
        }
        Ok(())
    }

    fn answer<S: Read + Write>(
        &mut self,
        kind: CredentialKind,
        line: &ReplyLine<'_>,
        conn: &mut Connection<S>,
    ) -> Result<()> {
        let text = line.text();
        let prompt = if text.is_empty() {
            match kind {
                CredentialKind::Secret => "Enter passphrase",
                CredentialKind::Username => "Enter username",
            }
        } else {
            text.as_str()
        };

        let value = self.bridge.obtain(kind, prompt)?;
        conn.send_all(value)
            .map_err(|source| WhackError::CredentialWrite { kind, source })?;
        self.status = 0;
        Ok(())
    }

    fn echo(&mut self, payload: &[u8]) {
        if let Err(e) = self
            .transcript
            .write_all(payload)
            .and_then(|()| self.transcript.flush())
        {
            error!(error = %e, "whack: write() of reply text failed, and ignored");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{Credential, MAX_SECRET_LEN};
    use pretty_assertions::assert_eq;
    use std::io;

    /// In-memory daemon side: serves `input` in chunks, records writes.
    struct Duplex {
        input: Vec<u8>,
        pos: usize,
        chunk: usize,
        written: Vec<u8>,
        fail_writes: bool,
        fail_reads: bool,
    }

    impl Duplex {
        fn new(input: &[u8]) -> Self {
            Self {
                input: input.to_vec(),
                pos: 0,
                chunk: usize::MAX,
                written: Vec::new(),
                fail_writes: false,
                fail_reads: false,
            }
        }

        fn chunked(input: &[u8], chunk: usize) -> Self {
            Self {
                chunk,
                ..Self::new(input)
            }
        }
    }

    impl Read for Duplex {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.fail_reads {
                return Err(io::Error::from(io::ErrorKind::ConnectionReset));
            }
            let n = buf
                .len()
                .min(self.chunk)
                .min(self.input.len() - self.pos);
            buf[..n].copy_from_slice(&self.input[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    impl Write for Duplex {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.fail_writes {
                return Err(io::Error::from(io::ErrorKind::BrokenPipe));
            }
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Scripted {
        secret: Vec<u8>,
        username: Vec<u8>,
        prompts: Vec<String>,
    }

    impl CredentialSource for Scripted {
        fn read_secret(&mut self, prompt: &str, _max: usize) -> io::Result<Credential> {
            self.prompts.push(prompt.to_string());
            Ok(Credential::new(self.secret.clone()))
        }

        fn read_username(&mut self, prompt: &str, _max: usize) -> io::Result<Credential> {
            self.prompts.push(prompt.to_string());
            Ok(Credential::new(self.username.clone()))
        }
    }

    struct Run {
        outcome: Result<ReplyOutcome>,
        transcript: String,
        written: Vec<u8>,
        prompts: Vec<String>,
    }

    fn run_with(mut daemon: Duplex, codes: ReplyCodes, mut source: Scripted) -> Run {
        let mut transcript = Vec::new();
        let mut conn = Connection::new(&mut daemon);
        let outcome = ReplyReader::new(codes, &mut transcript, CredentialBridge::new(&mut source))
            .run(&mut conn);
        drop(conn);
        Run {
            outcome,
            transcript: String::from_utf8(transcript).unwrap(),
            written: daemon.written,
            prompts: source.prompts,
        }
    }

    fn run(input: &[u8]) -> Run {
        run_with(Duplex::new(input), ReplyCodes::default(), Scripted::default())
    }

    #[test]
    fn test_parse_prefix() {
        let line = ReplyLine::parse(b"021 no connection named \"x\"\n").unwrap();
        assert_eq!(line.code, 21);
        assert_eq!(line.payload, b"no connection named \"x\"\n");
        assert_eq!(line.text(), "no connection named \"x\"");

        let empty = ReplyLine::parse(b"4 \n").unwrap();
        assert_eq!(empty.code, 4);
        assert_eq!(empty.payload, b"\n");
    }

    #[test]
    fn test_parse_rejects_malformed_prefixes() {
        for bad in [
            &b"not-a-number rest\n"[..],
            b"\n",
            b" 5 leading space\n",
            b"123abc\n",
            b"12\tx\n",
            b"99999999999 too big\n",
        ] {
            assert!(
                matches!(
                    ReplyLine::parse(bad),
                    Err(WhackError::ProtocolViolation { .. })
                ),
                "{:?}",
                String::from_utf8_lossy(bad)
            );
        }
    }

    #[test]
    fn test_classify_default_codes() {
        let codes = ReplyCodes::default();
        assert_eq!(codes.classify(rc::COMMENT), ReplyClass::Chatter);
        assert_eq!(codes.classify(rc::RAW), ReplyClass::Chatter);
        assert_eq!(codes.classify(rc::LOG), ReplyClass::Chatter);
        assert_eq!(codes.classify(rc::INFORMATIONAL), ReplyClass::Chatter);
        assert_eq!(codes.classify(rc::SUCCESS), ReplyClass::Success);
        assert_eq!(codes.classify(rc::ENTERSECRET), ReplyClass::EnterSecret);
        assert_eq!(codes.classify(rc::USERPROMPT), ReplyClass::UserPrompt);
        assert_eq!(codes.classify(rc::LOG_SERIOUS), ReplyClass::Status(3));
        assert_eq!(codes.classify(rc::UNKNOWN_NAME), ReplyClass::Status(21));
    }

    #[test]
    fn test_chatter_only_is_success() {
        let r = run(b"000 loading\n001 raw\n002 log\n005 info\n");
        assert_eq!(
            r.outcome.unwrap(),
            ReplyOutcome {
                status: 0,
                incomplete_final_line: false
            }
        );
        assert_eq!(r.transcript, "loading\nraw\nlog\ninfo\n");
    }

    #[test]
    fn test_success_line() {
        let r = run(b"002 starting\n004 done\n");
        assert_eq!(r.outcome.unwrap().status, 0);
        assert_eq!(r.transcript, "starting\ndone\n");
    }

    #[test]
    fn test_pass_through_code_is_result() {
        let r = run(b"000 looking\n021 no such conn\n");
        assert_eq!(r.outcome.unwrap().status, 21);
        assert_eq!(r.transcript, "looking\nno such conn\n");
    }

    #[test]
    fn test_later_success_clears_status() {
        let r = run(b"010 retransmitting\n004 established\n");
        assert_eq!(r.outcome.unwrap().status, 0);
    }

    #[test]
    fn test_last_status_wins() {
        let r = run(b"010 retransmitting\n036 timeout\n");
        assert_eq!(r.outcome.unwrap().status, 36);
    }

    #[test]
    fn test_byte_at_a_time_delivery() {
        let input = b"000 a\n021 b\n000 c\n";
        let whole = run(input);
        let split = run_with(
            Duplex::chunked(input, 1),
            ReplyCodes::default(),
            Scripted::default(),
        );
        assert_eq!(split.outcome.unwrap(), whole.outcome.unwrap());
        assert_eq!(split.transcript, whole.transcript);
    }

    #[test]
    fn test_secret_prompt_with_custom_code() {
        let codes = ReplyCodes {
            enter_secret: 100,
            ..ReplyCodes::default()
        };
        let source = Scripted {
            secret: b"hunter2".to_vec(),
            ..Default::default()
        };
        let r = run_with(Duplex::new(b"100 please enter secret\n"), codes, source);

        assert_eq!(r.outcome.unwrap().status, 0);
        assert_eq!(r.prompts, vec!["please enter secret".to_string()]);
        assert_eq!(r.written, b"hunter2");
        // prompt lines are not echoed
        assert_eq!(r.transcript, "");
    }

    #[test]
    fn test_repeated_prompt_reuses_cached_secret() {
        let source = Scripted {
            secret: b"pw".to_vec(),
            ..Default::default()
        };
        let r = run_with(
            Duplex::new(b"040 Enter secret\n036 bad password\n040 Enter secret\n004 ok\n"),
            ReplyCodes::default(),
            source,
        );
        assert_eq!(r.outcome.unwrap().status, 0);
        assert_eq!(r.prompts.len(), 1);
        assert_eq!(r.written, b"pwpw");
        assert_eq!(r.transcript, "bad password\nok\n");
    }

    #[test]
    fn test_username_then_secret() {
        let source = Scripted {
            secret: b"pw".to_vec(),
            username: b"alice".to_vec(),
            ..Default::default()
        };
        let r = run_with(
            Duplex::new(b"041 Username\n040 Password\n"),
            ReplyCodes::default(),
            source,
        );
        assert_eq!(r.outcome.unwrap().status, 0);
        assert_eq!(r.prompts, vec!["Username".to_string(), "Password".to_string()]);
        assert_eq!(r.written, b"alicepw");
    }

    #[test]
    fn test_over_long_secret_is_clamped_on_the_wire() {
        let mut secret = vec![b's'; MAX_SECRET_LEN];
        secret.push(b'!');
        let source = Scripted {
            secret: secret.clone(),
            ..Default::default()
        };
        let r = run_with(Duplex::new(b"040 \n"), ReplyCodes::default(), source);
        assert_eq!(r.outcome.unwrap().status, 0);
        assert_eq!(r.written, &secret[..MAX_SECRET_LEN]);
        assert_eq!(r.prompts, vec!["Enter passphrase".to_string()]);
    }

    #[test]
    fn test_malformed_line_is_fatal() {
        let r = run(b"000 fine\nnot-a-number rest\n004 never seen\n");
        let err = r.outcome.unwrap_err();
        assert!(matches!(err, WhackError::ProtocolViolation { ref line } if line == "not-a-number rest"));
        assert_ne!(err.status(), 0);
        assert_eq!(r.transcript, "fine\n");
    }

    #[test]
    fn test_unterminated_final_line_keeps_status() {
        let r = run(b"021 no such conn\n004 partial");
        assert_eq!(
            r.outcome.unwrap(),
            ReplyOutcome {
                status: 21,
                incomplete_final_line: true
            }
        );
        assert_eq!(r.transcript, "no such conn\n");
    }

    #[test]
    fn test_overlong_line_ends_the_stream() {
        let mut input = b"000 before\n".to_vec();
        input.extend(std::iter::repeat_n(b'x', MAX_LINE_LEN + 10));
        let r = run(&input);
        let outcome = r.outcome.unwrap();
        assert!(outcome.incomplete_final_line);
        assert_eq!(outcome.status, 0);
        assert_eq!(r.transcript, "before\n");
    }

    #[test]
    fn test_credential_write_failure_aborts() {
        let mut daemon = Duplex::new(b"040 Enter secret\n004 unreachable\n");
        daemon.fail_writes = true;
        let source = Scripted {
            secret: b"pw".to_vec(),
            ..Default::default()
        };
        let r = run_with(daemon, ReplyCodes::default(), source);
        let err = r.outcome.unwrap_err();
        assert!(matches!(
            err,
            WhackError::CredentialWrite {
                kind: CredentialKind::Secret,
                ..
            }
        ));
        assert_eq!(err.status(), rc::WHACK_PROBLEM as i32);
    }

    #[test]
    fn test_read_failure() {
        let mut daemon = Duplex::new(b"");
        daemon.fail_reads = true;
        let r = run_with(daemon, ReplyCodes::default(), Scripted::default());
        assert!(matches!(r.outcome, Err(WhackError::Read(_))));
    }

    #[test]
    fn test_empty_stream_is_success() {
        let r = run(b"");
        assert_eq!(
            r.outcome.unwrap(),
            ReplyOutcome {
                status: 0,
                incomplete_final_line: false
            }
        );
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        fn is_special(code: u32) -> bool {
            !matches!(ReplyCodes::default().classify(code), ReplyClass::Status(_))
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(128))]

            #[test]
            fn prop_pass_through_code_is_result(
                code in (0u32..=i32::MAX as u32).prop_filter("special code", |c| !is_special(*c))
            ) {
                let r = run(format!("{code} x\n").as_bytes());
                prop_assert_eq!(r.outcome.unwrap().status, code as i32);
                prop_assert_eq!(r.transcript, "x\n");
            }

            #[test]
            fn prop_chatter_lines_leave_status_zero(
                codes in proptest::collection::vec(
                    prop::sample::select(vec![rc::COMMENT, rc::RAW, rc::LOG, rc::INFORMATIONAL]),
                    0..20,
                )
            ) {
                let input: String = codes.iter().map(|c| format!("{c} chatter\n")).collect();
                let r = run(input.as_bytes());
                prop_assert_eq!(r.outcome.unwrap().status, 0);
            }
        }
    }
}
