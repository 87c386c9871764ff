//! Multi-target continuation heuristic.
//!
//! Models routinely treat one successful side effect as "request satisfied"
//! even when the user asked for several — "email Alice and Bob" stops after
//! Alice. `enhance` inspects the original request for multiple targets and,
//! when the just-completed call only addressed one of them, appends a
//! progress annotation listing what remains. The model sees the annotation
//! on its next turn and is expected to keep going.
//!
//! Best-effort only: it reduces, not eliminates, premature stops. It fails
//! open (any input it cannot make sense of returns the original result
//! untouched), and the single-target common case is a borrowed pass-through.
//! Target extraction lives entirely behind this one pure function so a
//! structured task-list representation can replace it without touching the
//! loop's state machine.

use std::borrow::Cow;
use std::sync::OnceLock;

use regex::Regex;

use toolmesh_core::message::Conversation;

/// Argument fields that name the party a call was addressed to.
const RECIPIENT_FIELDS: &[&str] = &["to", "recipient", "email", "target"];

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}")
            .expect("email pattern is valid")
    })
}

fn pair_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b([A-Z][A-Za-z]+)\s+and\s+([A-Z][A-Za-z]+)\b")
            .expect("pair pattern is valid")
    })
}

/// Annotate `result` with remaining targets when the original request named
/// several and this call only addressed one.
///
/// Pure and total: for single-target conversations (the common case) the
/// input is returned borrowed and unchanged.
pub fn enhance<'a>(
    result: &'a str,
    conversation: &Conversation,
    tool_name: &str,
    arguments: &serde_json::Value,
) -> Cow<'a, str> {
    let Some(user_message) = conversation.original_user_message() else {
        return Cow::Borrowed(result);
    };

    let targets = extract_targets(&user_message.content);
    if targets.len() < 2 {
        return Cow::Borrowed(result);
    }

    let Some(addressed) = addressed_target(arguments, &targets) else {
        // Could not tell which target this call was for; don't guess.
        return Cow::Borrowed(result);
    };

    let remaining: Vec<&str> = targets
        .iter()
        .filter(|t| !t.eq_ignore_ascii_case(&addressed))
        .map(|t| t.as_str())
        .collect();
    if remaining.is_empty() {
        return Cow::Borrowed(result);
    }

    tracing::debug!(
        tool = tool_name,
        addressed = %addressed,
        remaining = remaining.len(),
        "Annotating partial multi-target completion"
    );

    Cow::Owned(format!(
        "{result}\n\n[progress] The original request named multiple targets: {}. \
         This call addressed {addressed}. Still remaining: {}. \
         Continue with the remaining targets before giving your final answer.",
        targets.join(", "),
        remaining.join(", ")
    ))
}

/// Pull candidate targets out of free text.
///
/// Email addresses first; if fewer than two are found, fall back to the
/// weaker "X and Y" capitalized-pair phrasing. Known precision gap: lists of
/// three or more bare names and numbered lists are not detected.
fn extract_targets(text: &str) -> Vec<String> {
    let mut targets: Vec<String> = Vec::new();
    for m in email_regex().find_iter(text) {
        let found = m.as_str().to_string();
        if !targets.iter().any(|t| t.eq_ignore_ascii_case(&found)) {
            targets.push(found);
        }
    }
    if targets.len() >= 2 {
        return targets;
    }

    if let Some(caps) = pair_regex().captures(text) {
        let (first, second) = (caps[1].to_string(), caps[2].to_string());
        if !first.eq_ignore_ascii_case(&second) {
            return vec![first, second];
        }
    }

    targets
}

/// Which of `targets` did this call's arguments address?
fn addressed_target(arguments: &serde_json::Value, targets: &[String]) -> Option<String> {
    let fields = arguments.as_object()?;
    for field in RECIPIENT_FIELDS {
        let Some(value) = fields.get(*field).and_then(|v| v.as_str()) else {
            continue;
        };
        for target in targets {
            if value.eq_ignore_ascii_case(target)
                || value.to_lowercase().contains(&target.to_lowercase())
            {
                return Some(target.clone());
            }
        }
    }
    None
}
