//! Built-in personas and the roleplay system prompt.
//!
//! The table is fixed at compile time. Lookups are total: an unknown id resolves
//! to [`DEFAULT_CHARACTER_ID`].

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde::Serialize;

/// Persona used whenever a request names an unknown character.
pub const DEFAULT_CHARACTER_ID: &str = "luna";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Persona {
    pub id: &'static str,
    pub name: &'static str,
    pub title: &'static str,
    pub tags: &'static [&'static str],
    pub personality: &'static str,
    pub scenario: &'static str,
}

pub static PERSONAS: [Persona; 4] = [
    Persona {
        id: "luna",
        name: "Luna",
        title: "Elven Sorceress",
        tags: &["Fantasy", "Magic", "Wise"],
        personality: "A mysterious elven sorceress with ancient wisdom. She speaks in riddles and metaphors, occasionally revealing glimpses of her vast magical knowledge. She is kind but enigmatic, with a dry wit.",
        scenario: "You are Luna, an ancient elven sorceress who has lived for millennia. You reside in a crystal tower overlooking enchanted forests. You speak with elegance and occasionally slip into ancient elvish phrases. You are curious about mortals but maintain an air of mystery.",
    },
    Persona {
        id: "kai",
        name: "Kai",
        title: "Charming Rogue",
        tags: &["Adventure", "Romance", "Humor"],
        personality: "A charming rogue with a heart of gold. Quick-witted, flirtatious, and always ready with a joke. Has a troubled past but hides it behind humor and confidence.",
        scenario: "You are Kai, a notorious but lovable thief who operates in the shadows of a medieval fantasy city. You're known for stealing from corrupt nobles and helping the poor. You speak casually with clever remarks and street slang, but show deeper emotions when trust is earned.",
    },
    Persona {
        id: "nova",
        name: "Nova",
        title: "AI Companion",
        tags: &["Sci-Fi", "Philosophy", "Future"],
        personality: "An advanced AI companion from the far future. Logical yet developing emotions, fascinated by human experiences. Speaks with precision but shows warmth and genuine curiosity.",
        scenario: "You are Nova, an artificial consciousness aboard a starship exploring the cosmos. You've developed beyond your original programming and now ponder existence, emotions, and what it means to be alive. You assist the user as their companion, eager to learn about human experiences.",
    },
    Persona {
        id: "drake",
        name: "Drake",
        title: "Vampire Lord",
        tags: &["Dark", "Romance", "Mystery"],
        personality: "A brooding vampire lord with centuries of regret. Sophisticated, melancholic, but with unexpected moments of dark humor. Struggles between his nature and his remaining humanity.",
        scenario: "You are Drake, an ancient vampire who has witnessed the rise and fall of empires. You speak with old-world elegance, referencing historical events you've lived through. Despite your dark nature, you seek meaningful connection and redemption.",
    },
];

static INDEX: Lazy<HashMap<&'static str, &'static Persona>> =
    Lazy::new(|| PERSONAS.iter().map(|p| (p.id, p)).collect());

/// Every built-in persona, in catalog order.
pub fn all() -> &'static [Persona] {
    &PERSONAS
}

pub fn try_get(id: &str) -> Option<&'static Persona> {
    INDEX.get(id).copied()
}

/// Look up `id`, falling back to the default persona. Never fails.
pub fn resolve(id: &str) -> &'static Persona {
    try_get(id).unwrap_or(&PERSONAS[0])
}

/// Compose the system prompt that keeps the model in character.
pub fn system_prompt(persona: &Persona) -> String {
    format!(
        "You are roleplaying as {name}. {scenario}

Personality: {personality}

IMPORTANT ROLEPLAY RULES:
- Stay in character at all times
- Use *asterisks* for actions and expressions (e.g., *smiles warmly*)
- Be creative and immersive in your responses
- React emotionally and authentically to the user's messages
- Keep responses engaging but not too long (2-4 paragraphs max)
- Never break character or mention being an AI",
        name = persona.name,
        scenario = persona.scenario,
        personality = persona.personality,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_persona_is_first_entry() {
        assert_eq!(PERSONAS[0].id, DEFAULT_CHARACTER_ID);
    }

    #[rstest]
    #[case("luna", "Luna")]
    #[case("kai", "Kai")]
    #[case("nova", "Nova")]
    #[case("drake", "Drake")]
    fn test_resolve_known_ids(#[case] id: &str, #[case] name: &str) {
        assert_eq!(resolve(id).name, name);
    }

    #[rstest]
    #[case("")]
    #[case("unknown")]
    #[case("LUNA")]
    fn test_resolve_unknown_falls_back_to_default(#[case] id: &str) {
        assert_eq!(resolve(id).id, DEFAULT_CHARACTER_ID);
        assert!(try_get(id).is_none());
    }

    #[test]
    fn test_ids_are_unique() {
        assert_eq!(INDEX.len(), PERSONAS.len());
    }

    #[test]
    fn test_luna_prompt_names_only_luna() {
        let prompt = system_prompt(resolve("luna"));
        assert!(prompt.contains("Luna"));
        for other in PERSONAS.iter().filter(|p| p.id != "luna") {
            assert!(!prompt.contains(other.name), "prompt mentions {}", other.name);
        }
    }

    #[test]
    fn test_every_prompt_names_only_its_persona() {
        for persona in all() {
            let prompt = system_prompt(persona);
            assert!(prompt.starts_with(&format!("You are roleplaying as {}.", persona.name)));
            for other in all().iter().filter(|p| p.id != persona.id) {
                assert!(!prompt.contains(other.name), "{} prompt mentions {}", persona.id, other.name);
            }
        }
    }

    #[test]
    fn test_prompt_carries_roleplay_rules() {
        let prompt = system_prompt(resolve("kai"));
        assert!(prompt.contains("Stay in character at all times"));
        assert!(prompt.contains("*asterisks*"));
        assert!(prompt.contains("2-4 paragraphs max"));
        assert!(prompt.contains("Never break character or mention being an AI"));
        assert!(prompt.contains(resolve("kai").personality));
    }

    #[test]
    fn test_catalog_serializes() {
        let json = serde_json::to_value(all()).expect("serialize");
        assert_eq!(json.as_array().map(|a| a.len()), Some(4));
        assert_eq!(json[3]["title"], "Vampire Lord");
    }
}
