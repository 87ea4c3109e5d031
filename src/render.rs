use crossterm::{
    queue,
    style::{Attribute, Print, ResetColor, SetAttribute, SetBackgroundColor},
};
use std::io::{self, Write};
use tracing::trace;

use crate::confidence::{color_for, Confidence};
use crate::decoder::TokenEvent;

/// Receives the prompt and then each generated token as the stream is decoded.
pub trait TokenSink {
    fn prompt(&mut self, prompt: &str) -> io::Result<()>;
    fn token(&mut self, event: &TokenEvent) -> io::Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Prompt(String),
    Token {
        text: String,
        confidence: Confidence,
    },
}

/// `Console` writes the prompt in bold and every token on a background colored by its
/// confidence bucket, and keeps a record of everything so it can be exported as HTML
/// once generation is done.
pub struct Console<W: Write> {
    out: W,
    styled: bool,
    segments: Vec<Segment>,
}

impl Console<io::Stdout> {
    /// A styled console on stdout.
    pub fn stdout() -> Self {
        Console::new(io::stdout(), true)
    }
}

impl<W: Write> Console<W> {
    pub fn new(out: W, styled: bool) -> Self {
        Console {
            out,
            styled,
            segments: Vec::new(),
        }
    }

    /// A console that writes text without any ANSI styling.
    pub fn plain(out: W) -> Self {
        Console::new(out, false)
    }

    /// Number of tokens appended so far.
    pub fn token_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Token { .. }))
            .count()
    }

    /// Ends the current line on the terminal.
    pub fn finish(&mut self) -> io::Result<()> {
        writeln!(self.out)?;
        self.out.flush()
    }

    /// Renders everything recorded so far as a self-contained HTML document.
    pub fn export_html(&self) -> String {
        let mut body = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Prompt(text) => {
                    body.push_str("<span style=\"font-weight: bold\">");
                    body.push_str(&escape_html(text));
                    body.push_str("</span>");
                }
                Segment::Token { text, confidence } => {
                    body.push_str(&format!(
                        "<span style=\"background-color: {}\">",
                        confidence.css_color()
                    ));
                    body.push_str(&escape_html(text));
                    body.push_str("</span>");
                }
            }
        }

        format!(
            "<!DOCTYPE html>\n\
             <html>\n\
             <head>\n\
             <meta charset=\"UTF-8\">\n\
             <style>\n\
             body {{ color: #000000; background-color: #ffffff; }}\n\
             </style>\n\
             </head>\n\
             <body>\n\
             <pre style=\"font-family: Menlo, 'DejaVu Sans Mono', consolas, 'Courier New', monospace; white-space: pre-wrap\"><code>{}</code></pre>\n\
             </body>\n\
             </html>\n",
            body
        )
    }
}

impl<W: Write> TokenSink for Console<W> {
    fn prompt(&mut self, prompt: &str) -> io::Result<()> {
        if self.styled {
            queue!(
                self.out,
                SetAttribute(Attribute::Bold),
                Print(prompt),
                SetAttribute(Attribute::Reset)
            )?;
        } else {
            write!(self.out, "{}", prompt)?;
        }
        self.out.flush()?;

        self.segments.push(Segment::Prompt(prompt.to_string()));
        Ok(())
    }

    fn token(&mut self, event: &TokenEvent) -> io::Result<()> {
        let confidence = color_for(event.logprob);
        trace!(token = %event.token, probability = event.probability(), ?confidence);
        if self.styled {
            queue!(
                self.out,
                SetBackgroundColor(confidence.terminal_color()),
                Print(&event.token),
                ResetColor
            )?;
        } else {
            write!(self.out, "{}", event.token)?;
        }
        self.out.flush()?;

        self.segments.push(Segment::Token {
            text: event.token.clone(),
            confidence,
        });
        Ok(())
    }
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_console_writes_text_only() {
        let mut buf = Vec::new();
        {
            let mut console = Console::plain(&mut buf);
            console.prompt("Once upon").unwrap();
            console.token(&TokenEvent::new(" a", -0.1)).unwrap();
            console.token(&TokenEvent::new(" time", -3.0)).unwrap();
            assert_eq!(console.token_count(), 2);
        }
        let out = String::from_utf8(buf).unwrap();
        assert_eq!(out, "Once upon a time");
    }

    #[test]
    fn styled_console_emits_ansi_sequences() {
        let mut buf = Vec::new();
        {
            let mut console = Console::new(&mut buf, true);
            console.prompt("Hi").unwrap();
            console.token(&TokenEvent::new("!", -0.01)).unwrap();
        }
        let out = String::from_utf8(buf).unwrap();
        assert!(out.contains("\x1b["));
        assert!(out.contains("Hi"));
        assert!(out.contains('!'));
    }

    #[test]
    fn html_export_marks_confidence() {
        let mut console = Console::plain(Vec::new());
        console.prompt("Q:").unwrap();
        console.token(&TokenEvent::new(" yes", 0.9f64.ln())).unwrap();
        console.token(&TokenEvent::new(" maybe", 0.5f64.ln())).unwrap();
        let html = console.export_html();
        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(html.contains("<span style=\"font-weight: bold\">Q:</span>"));
        assert!(html.contains("<span style=\"background-color: green\"> yes</span>"));
        assert!(html.contains("<span style=\"background-color: red\"> maybe</span>"));
    }

    #[test]
    fn html_export_escapes_tokens() {
        let mut console = Console::plain(Vec::new());
        console.prompt("<b>").unwrap();
        console.token(&TokenEvent::new("a & \"b\"", -0.1)).unwrap();
        let html = console.export_html();
        assert!(html.contains("&lt;b&gt;"));
        assert!(html.contains("a &amp; &quot;b&quot;"));
        assert!(!html.contains("<b>"));
    }
}
