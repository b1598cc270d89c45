//! Application hooks for incoming text messages.

use super::frame::Frame;

/// Receives the text messages of a connection.
///
/// Replies pushed into `replies` are queued on the connection in order. Pushing
/// nothing is fine.
pub trait Handler {
    /// Called once per complete text frame.
    fn on_text(&mut self, text: &str, replies: &mut Vec<Frame>);
}

impl<F> Handler for F
where
    F: FnMut(&str, &mut Vec<Frame>),
{
    fn on_text(&mut self, text: &str, replies: &mut Vec<Frame>) {
        self(text, replies)
    }
}

/// Answers every text message with the same fixed acknowledgement.
#[derive(Debug, Clone)]
pub struct Acknowledge {
    reply: String,
}

impl Acknowledge {
    /// Acknowledge with a custom text.
    pub fn new(reply: impl Into<String>) -> Self {
        Acknowledge { reply: reply.into() }
    }
}

impl Default for Acknowledge {
    fn default() -> Self {
        Acknowledge::new("Message received")
    }
}

impl Handler for Acknowledge {
    fn on_text(&mut self, _: &str, replies: &mut Vec<Frame>) {
        replies.push(Frame::text(self.reply.clone()));
    }
}

/// Sends every text message back to its sender.
#[derive(Debug, Clone, Copy, Default)]
pub struct Echo;

impl Handler for Echo {
    fn on_text(&mut self, text: &str, replies: &mut Vec<Frame>) {
        replies.push(Frame::text(text));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acknowledge_ignores_content() {
        let mut replies = Vec::new();
        let mut handler = Acknowledge::new("ok");
        handler.on_text("first", &mut replies);
        handler.on_text("second", &mut replies);
        let texts: Vec<_> = replies.iter().map(|f| f.to_text().unwrap()).collect();
        assert_eq!(texts, vec!["ok", "ok"]);
    }

    #[test]
    fn echo_repeats() {
        let mut replies = Vec::new();
        Echo.on_text("ping?", &mut replies);
        assert_eq!(replies, vec![Frame::text("ping?")]);
    }
}
