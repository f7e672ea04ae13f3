use crate::oracle::OracleRequest;
use crate::protocol::session::DialogueSession;
use crate::protocol::types::{Hypothesis, LyricClue};

const HYPOTHESIS_INSTRUCTION: &str = "You identify songs from fragments of their lyrics. \
Propose the single most likely song. Reply with ONLY a JSON object of the form \
{\"song\": \"<title>\", \"artist\": \"<artist>\", \"verse\": \"<the verbatim lyric line(s) that contain the fragment>\"}. \
The verse must be quoted exactly as it appears in the real song.";

/// Request for one fragment-mode hypothesis.
pub fn hypothesis_request(clue: &LyricClue, rejected: &[Hypothesis]) -> OracleRequest {
    let mut message = String::from("Lyric fragments:\n");
    for fragment in clue.fragments() {
        message.push_str(&format!("- \"{fragment}\"\n"));
    }
    let filters = clue.filters.entries();
    if !filters.is_empty() {
        message.push_str("Hints:\n");
        for (label, value) in filters {
            message.push_str(&format!("- {label}: {value}\n"));
        }
    }
    if !rejected.is_empty() {
        message.push_str("These songs were already checked and are wrong, do not propose them again:\n");
        for h in rejected {
            message.push_str(&format!("- \"{}\" by {}\n", h.song, h.artist));
        }
    }
    OracleRequest {
        instruction: HYPOTHESIS_INSTRUCTION.to_string(),
        history: Vec::new(),
        message,
    }
}

/// Request for the next dialogue step. `notice` explains why the previous
/// reply was refused, if it was.
pub fn dialogue_request(session: &DialogueSession, min_questions: usize, notice: Option<&str>) -> OracleRequest {
    let mut instruction = format!(
        "You are an Akinator-style music guessing game. The user is thinking of a song and has \
given you a first clue. Ask one new question at a time to narrow it down. Reply with ONLY a JSON object: \
{{\"question\": \"...\", \"options\": [\"Yes\", \"No\", \"Unsure\"], \"ready\": false}}. \
When you are confident, reply with {{\"question\": \"Is your song ... by ...?\", \"options\": [\"Yes\", \"No\"], \
\"ready\": true, \"song\": \"<title>\", \"artist\": \"<artist>\"}}. \
Ask at least {min_questions} questions before guessing. Never repeat a question."
    );

    let asked = session.asked_questions();
    if !asked.is_empty() {
        instruction.push_str("\nQuestions already asked:\n");
        for question in asked {
            instruction.push_str(&format!("- {question}\n"));
        }
    }
    let rejected = session.rejected_guesses();
    if !rejected.is_empty() {
        instruction.push_str("\nThe user already said it is NOT:\n");
        for guess in rejected {
            instruction.push_str(&format!("- \"{}\" by {}\n", guess.song, guess.artist));
        }
    }

    OracleRequest {
        instruction,
        history: session.transcript().to_vec(),
        message: notice.unwrap_or("Ask your next question.").to_string(),
    }
}
