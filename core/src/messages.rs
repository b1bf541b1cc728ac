//! User-facing engine messages with built-in English and Spanish text

use std::collections::BTreeMap;

pub const FLOW_COMPLETED: &str = "flow_completed";
pub const FLOW_NOT_FOUND: &str = "flow_not_found";
pub const GENERIC_ERROR: &str = "generic_error";
pub const TOOL_FAILED: &str = "tool_failed";
pub const RECURSION_LIMIT: &str = "recursion_limit";
pub const RESUMING: &str = "resuming";
pub const CANCELLED: &str = "cancelled";
pub const NOTHING_TO_CANCEL: &str = "nothing_to_cancel";
pub const HELP: &str = "help";
pub const STATUS: &str = "status";
pub const SWITCH_CONFIRM: &str = "switch_confirm";
pub const CONTINUING: &str = "continuing";
pub const GUIDANCE: &str = "guidance";

const ENGLISH: &[(&str, &str)] = &[
    (FLOW_COMPLETED, "All done. Is there anything else I can help you with?"),
    (FLOW_NOT_FOUND, "I couldn't find a process called \"{flow}\"."),
    (GENERIC_ERROR, "I encountered an error, please try again."),
    (
        TOOL_FAILED,
        "Sorry, I couldn't complete {tool}, so I stopped {flow}. Please try again later.",
    ),
    (
        RECURSION_LIMIT,
        "That request went too many levels deep, so I stopped it. Please try again.",
    ),
    (RESUMING, "Let's get back to {flow}."),
    (CANCELLED, "Okay, I cancelled {flow}."),
    (NOTHING_TO_CANCEL, "There is nothing to cancel right now."),
    (HELP, "You are in {flow}. {description}\n{prompt}"),
    (
        STATUS,
        "Current process: {flow}. Steps remaining: {remaining}. Active processes: {depth}.",
    ),
    (
        SWITCH_CONFIRM,
        "You're in the middle of {flow}. Say \"switch\" to start {target} now, or \"continue\" to keep going.",
    ),
    (CONTINUING, "Okay, let's continue with {flow}."),
    (GUIDANCE, "(Say \"cancel\" to stop or \"help\" for options.)"),
];

const SPANISH: &[(&str, &str)] = &[
    (FLOW_COMPLETED, "Listo. ¿Hay algo más en lo que pueda ayudarte?"),
    (FLOW_NOT_FOUND, "No encontré un proceso llamado \"{flow}\"."),
    (GENERIC_ERROR, "Ocurrió un error, por favor inténtalo de nuevo."),
    (
        TOOL_FAILED,
        "Lo siento, no pude completar {tool}, así que detuve {flow}. Inténtalo más tarde.",
    ),
    (
        RECURSION_LIMIT,
        "La solicitud tiene demasiados niveles, así que la detuve. Inténtalo de nuevo.",
    ),
    (RESUMING, "Volvamos a {flow}."),
    (CANCELLED, "De acuerdo, cancelé {flow}."),
    (NOTHING_TO_CANCEL, "No hay nada que cancelar ahora."),
    (HELP, "Estás en {flow}. {description}\n{prompt}"),
    (
        STATUS,
        "Proceso actual: {flow}. Pasos restantes: {remaining}. Procesos activos: {depth}.",
    ),
    (
        SWITCH_CONFIRM,
        "Estás en medio de {flow}. Di \"cambiar\" para iniciar {target} ahora, o \"continuar\" para seguir.",
    ),
    (CONTINUING, "De acuerdo, sigamos con {flow}."),
    (GUIDANCE, "(Di \"cancelar\" para detener o \"ayuda\" para ver opciones.)"),
];

const FALLBACK_LANGUAGE: &str = "en";

/// Message catalogs keyed by language, then message key
#[derive(Debug, Clone)]
pub struct MessageRegistry {
    catalogs: BTreeMap<String, BTreeMap<String, String>>,
}

impl Default for MessageRegistry {
    fn default() -> Self {
        let mut registry = Self {
            catalogs: BTreeMap::new(),
        };
        for (language, table) in [("en", ENGLISH), ("es", SPANISH)] {
            for (key, text) in table {
                registry.insert(language, key, text);
            }
        }
        registry
    }
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, language: &str, key: &str, text: &str) {
        self.catalogs
            .entry(language.to_string())
            .or_default()
            .insert(key.to_string(), text.to_string());
    }

    /// Override or add one message
    pub fn with_message(mut self, language: &str, key: &str, text: &str) -> Self {
        self.insert(language, key, text);
        self
    }

    /// Raw text for `key`, falling back to English and then to the key itself
    pub fn get(&self, language: &str, key: &str) -> String {
        [language, FALLBACK_LANGUAGE]
            .iter()
            .find_map(|lang| self.catalogs.get(*lang).and_then(|c| c.get(key)))
            .cloned()
            .unwrap_or_else(|| key.to_string())
    }

    /// Text for `key` with `{name}` placeholders filled in
    pub fn format(&self, language: &str, key: &str, args: &[(&str, &str)]) -> String {
        let mut text = self.get(language, key);
        for (name, value) in args {
            text = text.replace(&format!("{{{}}}", name), value);
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_fallback() {
        let registry = MessageRegistry::new();
        assert_eq!(registry.get("es", RESUMING), "Volvamos a {flow}.");
        assert_eq!(registry.get("fr", RESUMING), "Let's get back to {flow}.");
        assert_eq!(registry.get("en", "no_such_key"), "no_such_key");
    }

    #[test]
    fn test_format_placeholders() {
        let registry = MessageRegistry::new();
        assert_eq!(
            registry.format("en", CANCELLED, &[("flow", "Checkout")]),
            "Okay, I cancelled Checkout."
        );
    }

    #[test]
    fn test_overrides() {
        let registry = MessageRegistry::new().with_message("en", FLOW_COMPLETED, "Done!");
        assert_eq!(registry.get("en", FLOW_COMPLETED), "Done!");
    }
}
