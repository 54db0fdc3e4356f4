use serde_json::Value;

use crate::api::{FormulationResponse, Ingredient};

/// Attributes the results panel highlights, in display order.
const HIGHLIGHTED: [(&str, &str); 3] = [
    ("usage", "Usage"),
    ("benefits", "Benefits"),
    ("concentration", "Concentration"),
];

fn display_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Array(items) if items.is_empty() => None,
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(display_value)
                .collect::<Vec<_>>()
                .join(", "),
        ),
        other => Some(other.to_string()),
    }
}

impl Ingredient {
    /// Highlighted attributes that are present, as `(label, value)`.
    pub fn detail_lines(&self) -> Vec<(&'static str, String)> {
        HIGHLIGHTED
            .iter()
            .filter_map(|(key, label)| {
                self.attributes
                    .get(*key)
                    .and_then(display_value)
                    .map(|value| (*label, value))
            })
            .collect()
    }

    /// Every attribute, sorted by key.
    pub fn all_attributes(&self) -> Vec<(String, String)> {
        let mut lines: Vec<_> = self
            .attributes
            .iter()
            .filter_map(|(key, value)| display_value(value).map(|v| (key.clone(), v)))
            .collect();
        lines.sort_by(|a, b| a.0.cmp(&b.0));
        lines
    }
}

pub struct Fundamental {
    pub title: &'static str,
    pub description: &'static str,
    pub examples: &'static str,
}

pub const FUNDAMENTALS: [Fundamental; 6] = [
    Fundamental {
        title: "Base Components",
        description: "Primary ingredients that form the foundation of your formulation",
        examples: "Water, oils, waxes, or other main carriers",
    },
    Fundamental {
        title: "Active Ingredients",
        description: "Key functional ingredients that provide the main benefits",
        examples: "Vitamins, antioxidants, peptides, or botanical extracts",
    },
    Fundamental {
        title: "Emollients & Humectants",
        description: "Ingredients that improve texture and moisture retention",
        examples: "Glycerin, shea butter, jojoba oil, or hyaluronic acid",
    },
    Fundamental {
        title: "Preservatives & Stabilizers",
        description: "Ingredients that maintain product safety and shelf life",
        examples: "Natural preservatives, antioxidants, or pH stabilizers",
    },
    Fundamental {
        title: "Enhancers & Additives",
        description: "Optional ingredients that improve performance or aesthetics",
        examples: "Fragrances, colorants, thickeners, or penetration enhancers",
    },
    Fundamental {
        title: "Balancing Agents",
        description: "Ingredients that ensure proper formulation stability",
        examples: "pH adjusters, emulsifiers, or viscosity modifiers",
    },
];

/// Result slot for the generate action.
#[derive(Debug, Clone, Default)]
pub struct GenerationState {
    result: Option<FormulationResponse>,
    error: Option<String>,
    generating: bool,
}

impl GenerationState {
    /// Returns false if a generation is already running.
    pub fn begin(&mut self) -> bool {
        if self.generating {
            return false;
        }
        self.generating = true;
        self.error = None;
        true
    }

    pub fn succeed(&mut self, result: FormulationResponse) {
        self.generating = false;
        self.error = None;
        self.result = Some(result);
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.generating = false;
        self.error = Some(error.into());
    }

    pub fn is_generating(&self) -> bool {
        self.generating
    }

    pub fn result(&self) -> Option<&FormulationResponse> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// The first `limit` ingredients of the current result.
    pub fn shown_ingredients(&self, limit: usize) -> &[Ingredient] {
        match &self.result {
            Some(result) => &result.ingredients[..result.ingredients.len().min(limit)],
            None => &[],
        }
    }
}
