//! Parsing of stdin lines into chat messages and call commands

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Message(String),
    Call { video: bool },
    Accept,
    Reject,
    Hangup,
    Mute,
    Camera,
    Help,
    Quit,
    Unknown(String),
    Empty,
}

impl Input {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Input::Empty;
        }
        // "//text" sends a message starting with a slash
        if let Some(text) = line.strip_prefix("//") {
            return Input::Message(format!("/{}", text));
        }
        let Some(command) = line.strip_prefix('/') else {
            return Input::Message(line.to_string());
        };

        match command.to_ascii_lowercase().as_str() {
            "call" => Input::Call { video: false },
            "video" => Input::Call { video: true },
            "accept" => Input::Accept,
            "reject" => Input::Reject,
            "hangup" | "end" => Input::Hangup,
            "mute" => Input::Mute,
            "camera" => Input::Camera,
            "help" => Input::Help,
            "quit" | "exit" => Input::Quit,
            other => Input::Unknown(other.to_string()),
        }
    }
}

pub const HELP: &str = "\
Type a line to send it to the conversation.
  /call     start a voice call
  /video    start a video call
  /accept   accept the incoming call
  /reject   decline the incoming call
  /hangup   end the current call
  /mute     toggle the microphone
  /camera   toggle the camera
  /quit     sign out and exit";
