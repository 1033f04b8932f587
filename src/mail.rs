use std::fmt::{self, Display};
use std::path::{Path, PathBuf};

use lettre::address::AddressError;
use lettre::message::header::{
	ContentDisposition, ContentTransferEncoding, ContentType, HeaderName, HeaderValue,
};
use lettre::message::{Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};

/// SMTP endpoint a composer sends through.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Server {
	pub host: String,
	pub port: u16,
}

impl Display for Server {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.host, self.port)
	}
}

/// The optional text fields of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Field {
	Subject,
	Body,
	Signature,
}

impl Field {
	fn as_repr(self) -> &'static str {
		match self {
			Self::Subject => "subject",
			Self::Body => "body",
			Self::Signature => "signature",
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
	#[error("{} is empty", .0.as_repr())]
	Empty(Field),
	#[error("{0:?} is not a regular file")]
	NotAFile(PathBuf),
	#[error("reading {path:?}")]
	Read {
		path: PathBuf,
		source: std::io::Error,
	},
	#[error("invalid sender address {address:?}")]
	InvalidSender {
		address: String,
		source: AddressError,
	},
	#[error("configuring relay")]
	Relay(#[source] lettre::transport::smtp::Error),
}

/// Why a message was not sent. The first three variants are checked in
/// declaration order before any connection is made.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
	#[error("subject of mail cannot be empty when an attachment is present")]
	MissingSubject,
	#[error("no valid attachment was added")]
	MissingAttachment,
	#[error("cannot send empty mail")]
	Empty,
	#[error("invalid recipient address {recipient:?}")]
	InvalidRecipient {
		recipient: String,
		source: AddressError,
	},
	#[error("assembling message: {0}")]
	Build(String),
	#[error("mail was not sent")]
	Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl SendError {
	/// Whether the message was refused before contacting the server.
	pub fn is_validation(&self) -> bool {
		matches!(self, Self::MissingSubject | Self::MissingAttachment | Self::Empty)
	}
}

#[derive(Clone, Debug)]
enum Part {
	Text(String),
	Attachment { filename: String, contents: Vec<u8> },
}

impl Part {
	fn to_single(&self) -> Result<SinglePart, SendError> {
		Ok(match self {
			Self::Text(text) => SinglePart::plain(text.clone()),
			Self::Attachment { filename, contents } => SinglePart::builder()
				.header(
					ContentType::parse("application/octet-stream")
						.map_err(|error| SendError::Build(error.to_string()))?,
				)
				.header(ContentDisposition::attachment(filename))
				.header(ContentTransferEncoding::Base64)
				.body(contents.clone()),
		})
	}
}

/// Accumulates a multipart message and sends it over one SMTP session per
/// call to [`MailComposer::send`].
///
/// The four `*_set` flags record which optional parts were supplied; they
/// alone decide whether a send is attempted.
pub struct MailComposer<T = SmtpTransport> {
	server: Server,
	sender: Mailbox,
	transport: T,
	subject: Option<String>,
	parts: Vec<Part>,
	subject_set: bool,
	body_set: bool,
	attachment_set: bool,
	signature_set: bool,
}

impl MailComposer {
	/// Composer that authenticates as `sender` on `server` after upgrading
	/// the connection with STARTTLS.
	pub fn new(server: Server, sender: &str, secret: &str) -> Result<Self, ComposeError> {
		let transport = SmtpTransport::starttls_relay(&server.host)
			.map_err(ComposeError::Relay)?
			.port(server.port)
			.credentials(Credentials::new(sender.to_owned(), secret.to_owned()))
			.build();
		Self::with_transport(server, sender, transport)
	}
}

impl<T> MailComposer<T>
where
	T: Transport,
	T::Error: std::error::Error + Send + Sync + 'static,
{
	pub fn with_transport(server: Server, sender: &str, transport: T) -> Result<Self, ComposeError> {
		let sender = sender
			.parse::<Mailbox>()
			.map_err(|source| ComposeError::InvalidSender {
				address: sender.to_owned(),
				source,
			})?;
		Ok(Self {
			server,
			sender,
			transport,
			subject: None,
			parts: Vec::new(),
			subject_set: false,
			body_set: false,
			attachment_set: false,
			signature_set: false,
		})
	}

	pub fn server(&self) -> &Server {
		&self.server
	}

	pub fn subject_set(&self) -> bool {
		self.subject_set
	}

	pub fn body_set(&self) -> bool {
		self.body_set
	}

	pub fn signature_set(&self) -> bool {
		self.signature_set
	}

	pub fn attachment_set(&self) -> bool {
		self.attachment_set
	}

	/// Replaces the subject. An empty subject leaves the previous one in place.
	pub fn set_subject(&mut self, text: &str) -> Result<(), ComposeError> {
		non_empty(Field::Subject, text)?;
		self.subject = Some(text.to_owned());
		self.subject_set = true;
		Ok(())
	}

	/// Appends a plain-text part. Each call adds another part.
	pub fn set_body(&mut self, text: &str) -> Result<(), ComposeError> {
		non_empty(Field::Body, text)?;
		self.parts.push(Part::Text(text.to_owned()));
		self.body_set = true;
		Ok(())
	}

	pub fn set_signature(&mut self, text: &str) -> Result<(), ComposeError> {
		non_empty(Field::Signature, text)?;
		self.parts.push(Part::Text(text.to_owned()));
		self.signature_set = true;
		Ok(())
	}

	/// Reads `path` and appends it as a base64 `application/octet-stream`
	/// part named after the file. On error nothing is appended and the
	/// attachment flag keeps its previous value.
	pub fn add_attachment(&mut self, path: impl AsRef<Path>) -> Result<(), ComposeError> {
		let path = path.as_ref();
		let filename = match path.file_name() {
			Some(name) if path.is_file() => name.to_string_lossy().into_owned(),
			_ => return Err(ComposeError::NotAFile(path.to_owned())),
		};
		let contents = std::fs::read(path).map_err(|source| ComposeError::Read {
			path: path.to_owned(),
			source,
		})?;

		let size = humansize::SizeFormatter::new(contents.len(), humansize::BINARY);
		tracing::info!(file = %filename, %size, "attached");

		self.parts.push(Part::Attachment { filename, contents });
		self.attachment_set = true;
		Ok(())
	}

	/// Validates the message and transmits it to `recipient`.
	///
	/// The session is opened for this call only and is closed before
	/// returning, whether or not transmission succeeded. Composed content is
	/// kept, so sending again without [`MailComposer::reset_email`] repeats it.
	pub fn send(&self, recipient: &str) -> Result<(), SendError> {
		let message = self.compose(recipient)?;

		if let Err(error) = self.transport.send(&message) {
			tracing::error!(server = %self.server, %error, "mail was not sent, check the sender address and secret");
			return Err(SendError::Transport(Box::new(error)));
		}

		tracing::info!(server = %self.server, recipient, "mail sent");
		Ok(())
	}

	/// The formatted message `send` would transmit, without contacting the server.
	pub fn preview(&self, recipient: &str) -> Result<Vec<u8>, SendError> {
		Ok(self.compose(recipient)?.formatted())
	}

	/// Drops all content and flags. Only the sender identity survives.
	pub fn reset_email(&mut self) {
		self.subject = None;
		self.parts.clear();
		self.subject_set = false;
		self.body_set = false;
		self.attachment_set = false;
		self.signature_set = false;
	}

	fn validate(&self) -> Result<(), SendError> {
		if self.attachment_set && !self.subject_set {
			return Err(SendError::MissingSubject);
		}
		// Every send requires an attachment, even when text parts are present.
		if !self.attachment_set {
			return Err(SendError::MissingAttachment);
		}
		if !self.subject_set && !self.body_set && !self.signature_set {
			return Err(SendError::Empty);
		}
		Ok(())
	}

	fn compose(&self, recipient: &str) -> Result<Message, SendError> {
		if let Err(error) = self.validate() {
			tracing::warn!(%error, "refusing to send");
			return Err(error);
		}

		let to = recipient
			.parse::<Mailbox>()
			.map_err(|source| SendError::InvalidRecipient {
				recipient: recipient.to_owned(),
				source,
			})?;

		let mut parts = self.parts.iter().map(Part::to_single);
		let first = parts.next().ok_or(SendError::MissingAttachment)??;
		let mut body = MultiPart::mixed().singlepart(first);
		for part in parts {
			body = body.singlepart(part?);
		}

		let mut builder = Message::builder()
			.from(self.sender.clone())
			.to(to)
			.raw_header(HeaderValue::new(
				HeaderName::new_from_ascii_str("Date"),
				chrono::Local::now().to_rfc2822(),
			));
		if let Some(subject) = &self.subject {
			builder = builder.subject(subject.clone());
		}

		builder
			.multipart(body)
			.map_err(|error| SendError::Build(error.to_string()))
	}
}

fn non_empty(field: Field, text: &str) -> Result<(), ComposeError> {
	if text.is_empty() {
		tracing::debug!(field = field.as_repr(), "ignoring empty value");
		return Err(ComposeError::Empty(field));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use std::cell::RefCell;
	use std::convert::Infallible;
	use std::rc::Rc;

	use base64::Engine as _;
	use lettre::address::Envelope;
	use lettre::transport::stub::StubTransport;

	use super::*;

	const SENDER: &str = "status@example.com";
	const RECIPIENT: &str = "ops@example.com";
	const SUBJECT: &str = "This is the mail subject!";
	const BODY: &str = "This is the mail body!";
	const SIGNATURE: &str = "This is the mail signature";
	const ATTACHMENT: &[u8] = b"PID TTY TIME CMD\n1 ? 00:00:01 init\n";

	#[derive(Clone, Default)]
	struct Recorder(Rc<RefCell<Vec<(Envelope, Vec<u8>)>>>);

	impl Recorder {
		fn sent(&self) -> Vec<(Envelope, String)> {
			self.0
				.borrow()
				.iter()
				.map(|(envelope, raw)| (envelope.clone(), String::from_utf8_lossy(raw).into_owned()))
				.collect()
		}
	}

	impl Transport for Recorder {
		type Ok = ();
		type Error = Infallible;

		fn send_raw(&self, envelope: &Envelope, email: &[u8]) -> Result<(), Infallible> {
			self.0.borrow_mut().push((envelope.clone(), email.to_vec()));
			Ok(())
		}
	}

	fn server() -> Server {
		Server {
			host: "smtp.example.com".into(),
			port: 587,
		}
	}

	fn composer() -> (MailComposer<Recorder>, Recorder) {
		let recorder = Recorder::default();
		let composer = MailComposer::with_transport(server(), SENDER, recorder.clone()).unwrap();
		(composer, recorder)
	}

	fn attachment_file() -> (tempfile::TempDir, PathBuf) {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("running_process.txt");
		std::fs::write(&path, ATTACHMENT).unwrap();
		(dir, path)
	}

	#[test]
	fn empty_values_are_rejected_without_setting_flags() {
		let (mut composer, recorder) = composer();

		assert!(matches!(composer.set_subject(""), Err(ComposeError::Empty(Field::Subject))));
		assert!(matches!(composer.set_body(""), Err(ComposeError::Empty(Field::Body))));
		assert!(matches!(
			composer.set_signature(""),
			Err(ComposeError::Empty(Field::Signature))
		));
		assert!(matches!(composer.add_attachment(""), Err(ComposeError::NotAFile(_))));

		assert!(!composer.subject_set());
		assert!(!composer.body_set());
		assert!(!composer.signature_set());
		assert!(!composer.attachment_set());
		assert!(matches!(composer.send(RECIPIENT), Err(SendError::MissingAttachment)));
		assert!(recorder.sent().is_empty());
	}

	#[test]
	fn empty_subject_keeps_previous_subject() {
		let (mut composer, _) = composer();
		let (_dir, path) = attachment_file();

		composer.set_subject(SUBJECT).unwrap();
		composer.set_subject("").unwrap_err();
		composer.add_attachment(&path).unwrap();

		assert!(composer.subject_set());
		let preview = String::from_utf8(composer.preview(RECIPIENT).unwrap()).unwrap();
		assert!(preview.contains(&format!("Subject: {SUBJECT}")));
	}

	#[test]
	fn missing_or_non_file_attachment_is_rejected() {
		let (mut composer, _) = composer();
		let dir = tempfile::tempdir().unwrap();

		assert!(matches!(
			composer.add_attachment(dir.path().join("xyz.txt")),
			Err(ComposeError::NotAFile(_))
		));
		assert!(matches!(composer.add_attachment(dir.path()), Err(ComposeError::NotAFile(_))));
		assert!(!composer.attachment_set());
	}

	#[test]
	fn failed_attachment_keeps_earlier_attachment() {
		let (mut composer, _) = composer();
		let (_dir, path) = attachment_file();

		composer.add_attachment(&path).unwrap();
		composer.add_attachment("xyz.txt").unwrap_err();

		assert!(composer.attachment_set());
	}

	#[test]
	fn attachment_is_required_even_with_text() {
		let (mut composer, recorder) = composer();

		composer.set_subject("Hi").unwrap();
		composer.set_body("text").unwrap();
		composer.add_attachment("xyz.txt").unwrap_err();

		let error = composer.send(RECIPIENT).unwrap_err();
		assert!(matches!(error, SendError::MissingAttachment));
		assert!(error.is_validation());
		assert!(recorder.sent().is_empty());
	}

	#[test]
	fn attachment_requires_subject() {
		let (mut composer, recorder) = composer();
		let (_dir, path) = attachment_file();

		composer.set_subject("").unwrap_err();
		composer.set_body(BODY).unwrap();
		composer.set_signature(SIGNATURE).unwrap();
		composer.add_attachment(&path).unwrap();

		assert!(matches!(composer.send(RECIPIENT), Err(SendError::MissingSubject)));
		assert!(recorder.sent().is_empty());
	}

	#[test]
	fn subject_and_attachment_alone_are_enough() {
		let (mut composer, recorder) = composer();
		let (_dir, path) = attachment_file();

		composer.set_subject("S").unwrap();
		composer.add_attachment(&path).unwrap();

		composer.send(RECIPIENT).unwrap();
		assert_eq!(recorder.sent().len(), 1);
	}

	#[test]
	fn transmitted_message_carries_every_part() {
		let (mut composer, recorder) = composer();
		let (_dir, path) = attachment_file();

		composer.set_subject(SUBJECT).unwrap();
		composer.set_body(BODY).unwrap();
		composer.set_signature(SIGNATURE).unwrap();
		composer.add_attachment(&path).unwrap();
		composer.send(RECIPIENT).unwrap();

		let sent = recorder.sent();
		assert_eq!(sent.len(), 1);
		let (envelope, raw) = &sent[0];

		assert_eq!(envelope.to().len(), 1);
		assert_eq!(envelope.to()[0].to_string(), RECIPIENT);
		assert_eq!(envelope.from().map(ToString::to_string).as_deref(), Some(SENDER));

		assert!(raw.contains(&format!("From: {SENDER}")));
		assert!(raw.contains(&format!("To: {RECIPIENT}")));
		assert!(raw.contains("Date: "));
		assert!(raw.contains(&format!("Subject: {SUBJECT}")));
		assert!(raw.contains("multipart/mixed"));
		assert!(raw.contains(BODY));
		assert!(raw.contains(SIGNATURE));
		assert!(raw.contains("application/octet-stream"));
		assert!(raw.contains("Content-Transfer-Encoding: base64"));
		assert!(raw.contains("filename=\"running_process.txt\""));
		let encoded = base64::engine::general_purpose::STANDARD.encode(ATTACHMENT);
		assert!(raw.contains(&encoded));
	}

	#[test]
	fn body_twice_appends_two_parts() {
		let (mut composer, _) = composer();
		let (_dir, path) = attachment_file();

		composer.set_subject(SUBJECT).unwrap();
		composer.set_body("first body").unwrap();
		composer.set_body("second body").unwrap();
		composer.add_attachment(&path).unwrap();

		let preview = String::from_utf8(composer.preview(RECIPIENT).unwrap()).unwrap();
		assert!(preview.contains("first body"));
		assert!(preview.contains("second body"));
	}

	#[test]
	fn repeated_send_resends_content() {
		let (mut composer, recorder) = composer();
		let (_dir, path) = attachment_file();

		composer.set_subject(SUBJECT).unwrap();
		composer.set_body(BODY).unwrap();
		composer.add_attachment(&path).unwrap();
		composer.send(RECIPIENT).unwrap();
		composer.send(RECIPIENT).unwrap();

		let sent = recorder.sent();
		assert_eq!(sent.len(), 2);
		for (_, raw) in &sent {
			assert!(raw.contains(BODY));
			assert!(raw.contains(&format!("Subject: {SUBJECT}")));
		}
	}

	#[test]
	fn reset_clears_flags_and_blocks_next_send() {
		let (mut composer, recorder) = composer();
		let (_dir, path) = attachment_file();

		composer.set_subject(SUBJECT).unwrap();
		composer.set_body(BODY).unwrap();
		composer.set_signature(SIGNATURE).unwrap();
		composer.add_attachment(&path).unwrap();
		let before = composer.send(RECIPIENT).is_ok();

		composer.reset_email();
		assert!(!composer.subject_set());
		assert!(!composer.body_set());
		assert!(!composer.signature_set());
		assert!(!composer.attachment_set());

		let after = composer.send(RECIPIENT).is_ok();
		assert_ne!(before, after);
		assert_eq!(recorder.sent().len(), 1);
	}

	#[test]
	fn transport_failure_is_reported() {
		let (_dir, path) = attachment_file();
		let mut composer =
			MailComposer::with_transport(server(), SENDER, StubTransport::new_error()).unwrap();

		composer.set_subject(SUBJECT).unwrap();
		composer.add_attachment(&path).unwrap();

		let error = composer.send(RECIPIENT).unwrap_err();
		assert!(matches!(error, SendError::Transport(_)));
		assert!(!error.is_validation());
	}

	#[test]
	fn invalid_addresses_are_rejected() {
		assert!(matches!(
			MailComposer::with_transport(server(), "not an address", Recorder::default()),
			Err(ComposeError::InvalidSender { .. })
		));

		let (mut composer, recorder) = composer();
		let (_dir, path) = attachment_file();
		composer.set_subject(SUBJECT).unwrap();
		composer.add_attachment(&path).unwrap();

		assert!(matches!(
			composer.send("nobody"),
			Err(SendError::InvalidRecipient { .. })
		));
		assert!(recorder.sent().is_empty());
	}

	#[test]
	fn server_is_displayed_as_host_and_port() {
		assert_eq!(server().to_string(), "smtp.example.com:587");
	}
}
