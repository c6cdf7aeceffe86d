//! Console command parsing

use anyhow::{bail, Context, Result};

/// What a console line asks the host to do
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Action {
    Play,
    Stop,
    Seek(u64),
    /// Loop markers in frames, or `None` to disable looping
    Loop(Option<(u64, u64)>),
    Record(bool),
    Click(bool),
    /// Song length in ticks
    Length(u64),
    Tempo(f64),
    Bounce(bool),
    Freewheel(bool),
    Idle(bool),
    ReSync,
    Panic,
    LocalOff,
    Learn,
    Mute(bool),
    Status,
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  play | stop                 start/stop the transport
  seek <frame>                locate
  loop <left> <right> | loop off
  record on|off   click on|off   bounce on|off
  freewheel on|off   idle on|off   mute on|off
  length <ticks>              song length
  bpm <tempo>                 replace the tempo map
  resync | panic | localoff | learn
  status | help | quit";

fn on_off(word: Option<&str>) -> Result<bool> {
    match word {
        Some("on") => Ok(true),
        Some("off") => Ok(false),
        Some(other) => bail!("expected on/off, got '{}'", other),
        None => bail!("expected on/off"),
    }
}

fn number<T: std::str::FromStr>(word: Option<&str>, what: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let word = word.with_context(|| format!("missing {}", what))?;
    word.parse()
        .with_context(|| format!("invalid {} '{}'", what, word))
}

/// Parse one console line; blank lines yield `None`
pub fn parse(line: &str) -> Result<Option<Action>> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Ok(None);
    };

    let action = match head {
        "play" => Action::Play,
        "stop" => Action::Stop,
        "seek" => Action::Seek(number(words.next(), "frame")?),
        "loop" => match words.next() {
            Some("off") => Action::Loop(None),
            first => {
                let left = number(first, "left marker")?;
                let right = number(words.next(), "right marker")?;
                if left >= right {
                    bail!("left marker must be before right marker");
                }
                Action::Loop(Some((left, right)))
            }
        },
        "record" => Action::Record(on_off(words.next())?),
        "click" => Action::Click(on_off(words.next())?),
        "length" => Action::Length(number(words.next(), "length")?),
        "bpm" => {
            let bpm: f64 = number(words.next(), "tempo")?;
            if !(bpm > 0.0 && bpm.is_finite()) {
                bail!("tempo must be positive");
            }
            Action::Tempo(bpm)
        }
        "bounce" => Action::Bounce(on_off(words.next())?),
        "freewheel" => Action::Freewheel(on_off(words.next())?),
        "idle" => Action::Idle(on_off(words.next())?),
        "mute" => Action::Mute(on_off(words.next())?),
        "resync" => Action::ReSync,
        "panic" => Action::Panic,
        "localoff" => Action::LocalOff,
        "learn" => Action::Learn,
        "status" => Action::Status,
        "help" | "?" => Action::Help,
        "quit" | "exit" => Action::Quit,
        other => bail!("unknown command '{}' (try 'help')", other),
    };
    Ok(Some(action))
}
