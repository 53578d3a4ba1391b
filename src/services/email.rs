use anyhow::Context;
use lettre::{
    message::{Mailbox, MultiPart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use uuid::Uuid;

use crate::config::Config;

const SENDER_NAME: &str = "EduTrack";

/// Port that speaks TLS from the first byte; every other port uses STARTTLS.
const IMPLICIT_TLS_PORT: u16 = 465;

/// A transactional email: one heading, some paragraphs and a call to action.
struct Notice<'a> {
    subject: String,
    greeting: &'a str,
    paragraphs: Vec<String>,
    action: (&'a str, &'a str),
    footer: Option<&'a str>,
}

impl Notice<'_> {
    fn text(&self) -> String {
        let mut out = format!("Hello {},\n\n", self.greeting);
        for p in &self.paragraphs {
            out.push_str(p);
            out.push_str("\n\n");
        }
        let (label, url) = self.action;
        out.push_str(&format!("{label}: {url}\n"));
        if let Some(footer) = self.footer {
            out.push_str(&format!("\n{footer}\n"));
        }
        out
    }

    fn html(&self) -> String {
        let (label, url) = self.action;
        let body: String = self.paragraphs.iter().map(|p| format!("<p>{}</p>", escape(p))).collect();
        let footer = self.footer.map(|f| format!("<p style=\"color:#94a3b8;font-size:13px\">{}</p>", escape(f)));
        format!(
            "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>{subject}</title></head>\
             <body style=\"font-family:Helvetica,Arial,sans-serif;background:#f8fafc;padding:32px\">\
             <div style=\"max-width:520px;margin:auto;background:#fff;border-radius:10px;padding:32px\">\
             <h2 style=\"margin-top:0\">{SENDER_NAME}</h2><p>Hello <strong>{greeting}</strong>,</p>{body}\
             <p><a href=\"{url}\" style=\"background:#1d4ed8;color:#fff;padding:12px 24px;border-radius:6px;\
             text-decoration:none\">{label}</a></p>{footer}</div></body></html>",
            subject = escape(&self.subject),
            greeting = escape(self.greeting),
            url = escape(url),
            label = escape(label),
            footer = footer.unwrap_or_default(),
        )
    }
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;").replace('"', "&quot;")
}

fn recipient(email: &str, name: &str) -> anyhow::Result<Mailbox> {
    format!("{name} <{email}>")
        .parse()
        .or_else(|_| email.parse())
        .context("Invalid recipient address")
}

pub struct EmailService {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl EmailService {
    /// `None` unless host, credentials and sender are all configured.
    pub fn new(config: &Config) -> Option<Self> {
        let host = config.smtp_host.as_deref()?;
        let creds = Credentials::new(config.smtp_username.clone()?, config.smtp_password.clone()?);
        let sender: Mailbox = config.smtp_from.as_deref()?.parse().ok()?;

        let port = config.smtp_port.unwrap_or(587);
        let builder = if port == IMPLICIT_TLS_PORT {
            AsyncSmtpTransport::<Tokio1Executor>::relay(host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
        };
        let transport = builder.ok()?.port(port).credentials(creds).build();

        Some(Self { transport, from: Mailbox::new(Some(SENDER_NAME.into()), sender.email) })
    }

    async fn deliver(&self, to: Mailbox, notice: &Notice<'_>) -> anyhow::Result<()> {
        let message = Message::builder()
            .message_id(Some(format!("<{}@{}>", Uuid::new_v4(), self.from.email.domain())))
            .from(self.from.clone())
            .to(to)
            .subject(notice.subject.as_str())
            .multipart(MultiPart::alternative_plain_html(notice.text(), notice.html()))
            .context("Failed to build email message")?;

        self.transport.send(message).await.context("SMTP delivery failed")?;
        Ok(())
    }

    pub async fn send_password_reset(&self, to_email: &str, to_name: &str, reset_url: &str) -> anyhow::Result<()> {
        let notice = Notice {
            subject: format!("Reset your {SENDER_NAME} password"),
            greeting: to_name,
            paragraphs: vec![format!("Someone asked to reset the password of your {SENDER_NAME} account.")],
            action: ("Choose a new password", reset_url),
            footer: Some("If you did not ask for this, ignore this email. The link expires soon."),
        };
        self.deliver(recipient(to_email, to_name)?, &notice).await
    }

    pub async fn send_welcome(&self, to_email: &str, to_name: &str, role: &str, login_url: &str) -> anyhow::Result<()> {
        let notice = Notice {
            subject: format!("Welcome to {SENDER_NAME}"),
            greeting: to_name,
            paragraphs: vec![
                format!("An account with the role \"{}\" is ready for you.", role.replace('_', " ")),
                "Your administrator will give you your first password, or use \"Forgot password\" to set one."
                    .to_string(),
            ],
            action: ("Sign in", login_url),
            footer: None,
        };
        self.deliver(recipient(to_email, to_name)?, &notice).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notice() -> Notice<'static> {
        Notice {
            subject: "Welcome".into(),
            greeting: "Ann <script>",
            paragraphs: vec!["Role \"teacher\" & more".into()],
            action: ("Sign in", "https://edutrack.test/login"),
            footer: Some("bye"),
        }
    }

    #[test]
    fn plain_text_lists_the_link() {
        let text = notice().text();
        assert!(text.starts_with("Hello Ann <script>,"));
        assert!(text.contains("Sign in: https://edutrack.test/login"));
        assert!(text.ends_with("bye\n"));
    }

    #[test]
    fn html_escapes_user_content() {
        let html = notice().html();
        assert!(html.contains("Ann &lt;script&gt;"));
        assert!(html.contains("Role &quot;teacher&quot; &amp; more"));
        assert!(!html.contains("<script>"));
    }

    #[test]
    fn recipient_falls_back_to_bare_address() {
        let mb = recipient("ann@example.org", "Ann <broken").unwrap();
        assert_eq!(mb.email.to_string(), "ann@example.org");
        assert!(recipient("not-an-email", "X").is_err());
    }
}
