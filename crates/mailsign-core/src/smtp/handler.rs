//! SMTP session handler

use super::session::Session;
use anyhow::Result;
use mailsign_common::config::ServerConfig;
use mailsign_common::Error;
use std::time::Duration;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
    BufWriter,
};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Longest command line accepted, CRLF included (RFC 5321 section 4.5.3.1.4)
const MAX_COMMAND_LINE: u64 = 512;

/// SMTP session state
#[derive(Debug, Clone, Copy, PartialEq)]
enum SessionState {
    Connected,
    Greeted,
    MailFrom,
    RcptTo,
}

/// Result of reading one line from the client
enum ReadLine {
    Line,
    Closed,
    TimedOut,
}

/// Result of reading message data after DATA
enum ReadData {
    Message(Vec<u8>),
    Closed,
    TimedOut,
}

/// SMTP session handler
pub struct SmtpHandler {
    config: ServerConfig,
    session: Session,
    peer: String,
}

impl SmtpHandler {
    /// Create a new handler
    pub fn new(config: ServerConfig, session: Session, peer: impl Into<String>) -> Self {
        Self {
            config,
            session,
            peer: peer.into(),
        }
    }

    fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.config.max_idle_seconds)
    }

    /// Handle an SMTP session
    pub async fn handle<S: AsyncRead + AsyncWrite + Unpin>(mut self, stream: S) -> Result<()> {
        let (reader, writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let mut writer = BufWriter::new(writer);

        let mut state = SessionState::Connected;

        self.send_response(
            &mut writer,
            220,
            &format!("{} ESMTP mailsign", self.config.domain),
        )
        .await?;

        let mut buf = Vec::new();

        loop {
            buf.clear();
            let limited = (&mut reader).take(MAX_COMMAND_LINE);
            match self.read_line(limited, &mut buf).await? {
                ReadLine::Line => {}
                ReadLine::Closed => {
                    debug!("Client {} disconnected", self.peer);
                    break;
                }
                ReadLine::TimedOut => {
                    info!("Client {} idle too long", self.peer);
                    self.send_idle_timeout(&mut writer).await?;
                    break;
                }
            }

            if !buf.ends_with(b"\n") {
                // Either the peer closed mid-line or the command is too long
                if (buf.len() as u64) < MAX_COMMAND_LINE || !self.skip_line(&mut reader).await? {
                    break;
                }
                self.send_response(&mut writer, 500, "5.5.6 Line too long").await?;
                continue;
            }

            let line = String::from_utf8_lossy(&buf);
            let line = line.trim();
            debug!("SMTP from {}: {}", self.peer, line);

            let (command, args) = parse_command(line);

            match command.to_uppercase().as_str() {
                "HELO" => {
                    self.session.reset();
                    state = SessionState::Greeted;
                    self.send_response(
                        &mut writer,
                        250,
                        &format!("{} Hello {}", self.config.domain, args),
                    )
                    .await?;
                }

                "EHLO" => {
                    self.session.reset();
                    state = SessionState::Greeted;

                    let responses = [
                        format!("{} Hello {}", self.config.domain, args),
                        format!("SIZE {}", self.config.max_message_bytes),
                        "8BITMIME".to_string(),
                        "PIPELINING".to_string(),
                        "ENHANCEDSTATUSCODES".to_string(),
                    ];

                    for (i, resp) in responses.iter().enumerate() {
                        if i == responses.len() - 1 {
                            self.send_response(&mut writer, 250, resp).await?;
                        } else {
                            self.send_response_continue(&mut writer, 250, resp).await?;
                        }
                    }
                }

                "MAIL" => {
                    if state != SessionState::Greeted {
                        self.send_response(&mut writer, 503, "5.5.1 Bad sequence of commands")
                            .await?;
                        continue;
                    }

                    let Some(path) = parse_path(args, "FROM:") else {
                        self.send_response(&mut writer, 501, "5.5.4 Syntax: MAIL FROM:<address>")
                            .await?;
                        continue;
                    };

                    match self.session.accept_sender(path) {
                        Ok(()) => {
                            state = SessionState::MailFrom;
                            self.send_response(&mut writer, 250, "2.1.0 OK").await?;
                        }
                        Err(e) => self.send_error(&mut writer, &e).await?,
                    }
                }

                "RCPT" => {
                    if state != SessionState::MailFrom && state != SessionState::RcptTo {
                        self.send_response(&mut writer, 503, "5.5.1 Bad sequence of commands")
                            .await?;
                        continue;
                    }

                    let Some(path) = parse_path(args, "TO:") else {
                        self.send_response(&mut writer, 501, "5.5.4 Syntax: RCPT TO:<address>")
                            .await?;
                        continue;
                    };

                    match self.session.accept_recipient(path) {
                        Ok(()) => {
                            state = SessionState::RcptTo;
                            self.send_response(&mut writer, 250, "2.1.5 OK").await?;
                        }
                        Err(e) => self.send_error(&mut writer, &e).await?,
                    }
                }

                "DATA" => {
                    if state != SessionState::RcptTo {
                        self.send_response(&mut writer, 503, "5.5.1 Bad sequence of commands")
                            .await?;
                        continue;
                    }

                    self.send_response(&mut writer, 354, "Start mail input; end with <CRLF>.<CRLF>")
                        .await?;

                    let data = match self.read_data(&mut reader).await {
                        Ok(ReadData::Message(data)) => data,
                        Ok(ReadData::Closed) => {
                            warn!("Client {} disconnected during DATA", self.peer);
                            self.session.reset();
                            break;
                        }
                        Ok(ReadData::TimedOut) => {
                            info!("Client {} idle too long during DATA", self.peer);
                            self.session.reset();
                            self.send_idle_timeout(&mut writer).await?;
                            break;
                        }
                        Err(e) => {
                            warn!("Failed to read message data from {}: {}", self.peer, e);
                            self.session.reset();
                            break;
                        }
                    };

                    match self.session.accept_data(&data[..]).await {
                        Ok(delivery) => {
                            self.send_response(
                                &mut writer,
                                250,
                                &format!("2.0.0 OK: relayed as {}", delivery.transaction_id),
                            )
                            .await?;
                        }
                        Err(e) => self.send_error(&mut writer, &e).await?,
                    }

                    state = SessionState::Greeted;
                }

                "RSET" => {
                    self.session.reset();
                    if state != SessionState::Connected {
                        state = SessionState::Greeted;
                    }
                    self.send_response(&mut writer, 250, "2.0.0 OK").await?;
                }

                "NOOP" => {
                    self.send_response(&mut writer, 250, "2.0.0 OK").await?;
                }

                "QUIT" => {
                    self.send_response(&mut writer, 221, "2.0.0 Bye").await?;
                    break;
                }

                "VRFY" => {
                    self.send_response(&mut writer, 252, "2.5.2 Cannot VRFY user")
                        .await?;
                }

                _ => {
                    self.send_response(&mut writer, 500, "5.5.2 Command not recognized")
                        .await?;
                }
            }
        }

        Ok(())
    }

    /// Read up to and including the next LF, bounded by the idle timeout
    async fn read_line<R: AsyncBufRead + Unpin>(
        &self,
        mut reader: R,
        buf: &mut Vec<u8>,
    ) -> Result<ReadLine> {
        match timeout(self.idle_timeout(), reader.read_until(b'\n', buf)).await {
            Ok(Ok(0)) => Ok(ReadLine::Closed),
            Ok(Ok(_)) => Ok(ReadLine::Line),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Ok(ReadLine::TimedOut),
        }
    }

    /// Discard input up to the next LF; false if the client went away first
    async fn skip_line<R: AsyncBufRead + Unpin>(&self, reader: &mut R) -> Result<bool> {
        let mut chunk = Vec::new();
        loop {
            chunk.clear();
            let limited = (&mut *reader).take(MAX_COMMAND_LINE);
            match self.read_line(limited, &mut chunk).await? {
                ReadLine::Line if chunk.ends_with(b"\n") => return Ok(true),
                ReadLine::Line => {}
                ReadLine::Closed | ReadLine::TimedOut => return Ok(false),
            }
        }
    }

    /// Read message data until <CRLF>.<CRLF>
    ///
    /// Dot-stuffing is undone and bare LF line endings become CRLF. At most
    /// one byte past the size limit is kept; the rest is read and dropped so
    /// the session stays in sync, and the session rejects the message.
    async fn read_data<R: AsyncBufRead + Unpin>(&self, reader: &mut R) -> Result<ReadData> {
        let keep = self.config.max_message_bytes + 1;
        let mut data = Vec::new();
        let mut line = Vec::new();
        // False while reading the remainder of an over-long line
        let mut line_start = true;

        loop {
            line.clear();
            let limited = (&mut *reader).take(keep as u64 + 2);
            match self.read_line(limited, &mut line).await? {
                ReadLine::Line => {}
                ReadLine::Closed => return Ok(ReadData::Closed),
                ReadLine::TimedOut => return Ok(ReadData::TimedOut),
            }

            if line_start && (line == b".\r\n" || line == b".\n") {
                break;
            }

            let mut content: &[u8] = &line;
            let terminated = content.ends_with(b"\n");
            if terminated {
                content = content
                    .strip_suffix(b"\r\n")
                    .or_else(|| content.strip_suffix(b"\n"))
                    .unwrap_or(content);
            }
            if line_start && content.starts_with(b".") {
                content = &content[1..];
            }
            line_start = terminated;

            if data.len() < keep {
                data.extend_from_slice(content);
                if terminated {
                    data.extend_from_slice(b"\r\n");
                }
                data.truncate(keep);
            }
        }

        Ok(ReadData::Message(data))
    }

    async fn send_idle_timeout<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut BufWriter<W>,
    ) -> Result<()> {
        self.send_response(
            writer,
            421,
            &format!("4.4.2 {} Idle timeout, closing connection", self.config.domain),
        )
        .await
    }

    async fn send_error<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut BufWriter<W>,
        error: &Error,
    ) -> Result<()> {
        let (code, message) = error.smtp_reply();
        debug!("Replying {} to {} for {}", code, self.peer, error.code());
        self.send_response(writer, code, message).await
    }

    /// Send an SMTP response
    async fn send_response<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut BufWriter<W>,
        code: u16,
        message: &str,
    ) -> Result<()> {
        let response = format!("{} {}\r\n", code, message);
        writer.write_all(response.as_bytes()).await?;
        writer.flush().await?;
        debug!("SMTP to {}: {}", self.peer, response.trim());
        Ok(())
    }

    /// Send a multi-line response (intermediate line)
    async fn send_response_continue<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut BufWriter<W>,
        code: u16,
        message: &str,
    ) -> Result<()> {
        let response = format!("{}-{}\r\n", code, message);
        writer.write_all(response.as_bytes()).await?;
        debug!("SMTP to {}: {}", self.peer, response.trim());
        Ok(())
    }
}

/// Parse an SMTP command line into command and arguments
fn parse_command(line: &str) -> (&str, &str) {
    match line.split_once(' ') {
        Some((command, args)) => (command, args.trim()),
        None => (line, ""),
    }
}

/// Extract the path from `FROM:<path> [params]` or `TO:<path> [params]`
///
/// Returns the path with its brackets; ESMTP parameters are ignored.
fn parse_path<'a>(args: &'a str, prefix: &str) -> Option<&'a str> {
    let head = args.get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }

    let rest = args[prefix.len()..].trim_start();
    if rest.starts_with('<') {
        let end = rest.find('>')?;
        Some(&rest[..=end])
    } else {
        rest.split_whitespace().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reload::ConfigHandle;
    use crate::signing::SigningPipeline;
    use crate::smtp::SessionLimits;
    use crate::testing::{self, RecordingRelay};
    use mailsign_common::Config;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use tokio::io::duplex;

    fn handler(config: Config, relay: Arc<RecordingRelay>) -> SmtpHandler {
        let server = config.server.clone();
        let pipeline = SigningPipeline::new(Arc::new(ConfigHandle::new(config)));
        let session = Session::new(SessionLimits::from(&server), Arc::new(pipeline), relay);
        SmtpHandler::new(server, session, "test-client")
    }

    /// Run a scripted client and return every reply line the server sent
    async fn converse(config: Config, relay: Arc<RecordingRelay>, script: &[u8]) -> Vec<String> {
        let (client, server) = duplex(64 * 1024);
        let task = tokio::spawn(handler(config, relay).handle(server));

        let (mut read, mut write) = tokio::io::split(client);
        write.write_all(script).await.unwrap();

        let mut output = String::new();
        read.read_to_string(&mut output).await.unwrap();
        task.await.unwrap().unwrap();

        output.lines().map(|l| l.to_string()).collect()
    }

    fn codes(replies: &[String]) -> Vec<&str> {
        replies
            .iter()
            .filter(|l| l.as_bytes().get(3) == Some(&b' '))
            .map(|l| &l[..3])
            .collect()
    }

    #[tokio::test]
    async fn test_submission_is_signed_and_relayed() {
        let relay = Arc::new(RecordingRelay::default());
        let script = b"EHLO client.test\r\n\
MAIL FROM:<a@example.com> SIZE=100\r\n\
RCPT TO:<b@test.org>\r\n\
DATA\r\n\
From: a@example.com\r\n\
To: b@test.org\r\n\
Subject: Hi\r\n\
\r\n\
..leading dot\r\n\
hello\r\n\
.\r\n\
QUIT\r\n";

        let replies = converse(testing::config(), relay.clone(), script).await;
        assert_eq!(codes(&replies), ["220", "250", "250", "250", "354", "250", "221"]);
        assert!(replies.iter().any(|l| l == "250-SIZE 1024"));

        let sent = relay.sent();
        assert_eq!(sent.len(), 1);
        let message = String::from_utf8(sent[0].1.clone()).unwrap();
        assert!(message.starts_with("DKIM-Signature: v=1; a=rsa-sha256; d=example.com; s=mail;"));
        assert!(message.ends_with("\r\n\r\n.leading dot\r\nhello\r\n"));
    }

    #[tokio::test]
    async fn test_bare_lf_is_normalized() {
        let relay = Arc::new(RecordingRelay::default());
        let script = b"HELO c\r\nMAIL FROM:<a@example.com>\r\nRCPT TO:<b@test.org>\r\nDATA\r\n\
From: a@example.com\nSubject: x\n\nbody\n.\nQUIT\r\n";

        let replies = converse(testing::config(), relay.clone(), script).await;
        assert_eq!(codes(&replies), ["220", "250", "250", "250", "354", "250", "221"]);

        let message = relay.sent()[0].1.clone();
        assert!(message.ends_with(b"From: a@example.com\r\nSubject: x\r\n\r\nbody\r\n"));
    }

    #[tokio::test]
    async fn test_unknown_sender_domain_rejected() {
        let relay = Arc::new(RecordingRelay::default());
        let script = b"EHLO c\r\nMAIL FROM:<a@elsewhere.net>\r\nRCPT TO:<b@test.org>\r\nDATA\r\n\
From: a@elsewhere.net\r\n\r\nhi\r\n.\r\nQUIT\r\n";

        let replies = converse(testing::config(), relay.clone(), script).await;
        assert_eq!(codes(&replies), ["220", "250", "250", "250", "354", "550", "221"]);
        assert!(relay.sent().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_message_is_drained_and_rejected() {
        let relay = Arc::new(RecordingRelay::default());
        let mut script = b"EHLO c\r\nMAIL FROM:<a@example.com>\r\nRCPT TO:<b@test.org>\r\nDATA\r\nFrom: a@example.com\r\n\r\n".to_vec();
        for _ in 0..40 {
            script.extend_from_slice(&[b'y'; 60]);
            script.extend_from_slice(b"\r\n");
        }
        script.extend_from_slice(b".\r\nNOOP\r\nQUIT\r\n");

        let replies = converse(testing::config(), relay.clone(), &script).await;
        assert_eq!(codes(&replies), ["220", "250", "250", "250", "354", "552", "250", "221"]);
        assert!(relay.sent().is_empty());
    }

    #[tokio::test]
    async fn test_too_many_recipients() {
        let relay = Arc::new(RecordingRelay::default());
        let script = b"EHLO c\r\nMAIL FROM:<a@example.com>\r\n\
RCPT TO:<r1@test.org>\r\nRCPT TO:<r2@test.org>\r\nRCPT TO:<r3@test.org>\r\nRCPT TO:<r4@test.org>\r\n\
QUIT\r\n";

        let replies = converse(testing::config(), relay, script).await;
        assert_eq!(codes(&replies), ["220", "250", "250", "250", "250", "250", "452", "221"]);
    }

    #[tokio::test]
    async fn test_bad_sequence_and_unknown_commands() {
        let relay = Arc::new(RecordingRelay::default());
        let script = b"MAIL FROM:<a@example.com>\r\nEHLO c\r\nRCPT TO:<b@test.org>\r\nDATA\r\n\
MAIL FROM:<bad address>\r\nSTARTTLS\r\nVRFY x\r\nRSET\r\nQUIT\r\n";

        let replies = converse(testing::config(), relay, script).await;
        assert_eq!(
            codes(&replies),
            ["220", "503", "250", "503", "503", "501", "500", "252", "250", "221"]
        );
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_session() {
        let relay = Arc::new(RecordingRelay::default());
        let mut config = testing::config();
        config.server.max_idle_seconds = 1;

        let (client, server) = duplex(1024);
        let task = tokio::spawn(handler(config, relay).handle(server));

        let (mut read, _write) = tokio::io::split(client);
        let mut output = String::new();
        read.read_to_string(&mut output).await.unwrap();
        task.await.unwrap().unwrap();

        assert!(output.starts_with("220 "));
        assert!(output.contains("421 4.4.2"));
    }

    #[tokio::test]
    async fn test_idle_timeout_during_data() {
        let relay = Arc::new(RecordingRelay::default());
        let mut config = testing::config();
        config.server.max_idle_seconds = 1;
        let script = b"EHLO c\r\nMAIL FROM:<a@example.com>\r\nRCPT TO:<b@test.org>\r\nDATA\r\n\
From: a@example.com\r\n\r\npartial";

        let replies = converse(config, relay.clone(), script).await;
        assert_eq!(codes(&replies), ["220", "250", "250", "250", "354", "421"]);
        assert!(replies.last().unwrap().starts_with("421 4.4.2"));
        assert!(relay.sent().is_empty());
    }

    #[test]
    fn test_parse_path() {
        assert_eq!(parse_path("FROM:<user@example.com>", "FROM:"), Some("<user@example.com>"));
        assert_eq!(parse_path("from: <user@example.com> BODY=8BITMIME", "FROM:"), Some("<user@example.com>"));
        assert_eq!(parse_path("FROM:<>", "FROM:"), Some("<>"));
        assert_eq!(parse_path("TO:user@example.com", "TO:"), Some("user@example.com"));
        assert_eq!(parse_path("invalid", "FROM:"), None);
        assert_eq!(parse_path("TO:<unterminated", "TO:"), None);
    }
}
