use std::collections::HashMap;

/// General dental service type used when a procedure has no specific mapping
pub const GENERAL_DENTAL_SERVICE_TYPE: &str = "35";

/// Map a dental procedure code to its X12 service type code.
pub fn service_type_code(procedure_code: &str) -> &'static str {
    match procedure_code {
        "D0120" | "D0210" => "23",
        "D2391" => "25",
        "D6010" => "26",
        "D6065" => "27",
        _ => GENERAL_DENTAL_SERVICE_TYPE,
    }
}

/// Benefit class a procedure falls into when the provider omits its benefit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcedureCategory {
    Preventive,
    Basic,
    Major,
    Unclassified,
}

impl ProcedureCategory {
    pub fn of(procedure_code: &str) -> Self {
        match procedure_code {
            "D0120" | "D0210" => Self::Preventive,
            "D2391" | "D7210" => Self::Basic,
            "D6010" | "D6065" | "D2740" | "D5110" => Self::Major,
            _ => Self::Unclassified,
        }
    }

    /// Conservative (coverage percentage, copay) assumed for the class
    pub fn default_benefit(&self) -> (f64, f64) {
        match self {
            Self::Preventive => (100.0, 0.0),
            Self::Basic => (80.0, 0.0),
            Self::Major => (50.0, 0.0),
            Self::Unclassified => (80.0, 25.0),
        }
    }
}

/// Source of the billed amount for a procedure
pub trait ProcedureCostSource: Send + Sync {
    fn cost_of(&self, procedure_code: &str) -> f64;
}

/// Fixed fee schedule with a fallback for unlisted procedures
#[derive(Debug, Clone)]
pub struct StaticCostTable {
    costs: HashMap<String, f64>,
    fallback: f64,
}

impl StaticCostTable {
    pub fn new(costs: HashMap<String, f64>, fallback: f64) -> Self {
        Self { costs, fallback }
    }

    pub fn with_cost(mut self, procedure_code: impl Into<String>, cost: f64) -> Self {
        self.costs.insert(procedure_code.into(), cost);
        self
    }
}

impl Default for StaticCostTable {
    fn default() -> Self {
        let costs = [
            ("D0120", 95.0),
            ("D0210", 150.0),
            ("D2391", 225.0),
            ("D6010", 3500.0),
            ("D6065", 2200.0),
            ("D7210", 180.0),
            ("D2740", 1200.0),
            ("D5110", 2500.0),
        ]
        .into_iter()
        .map(|(code, cost)| (code.to_string(), cost))
        .collect();
        Self::new(costs, 500.0)
    }
}

impl ProcedureCostSource for StaticCostTable {
    fn cost_of(&self, procedure_code: &str) -> f64 {
        self.costs
            .get(procedure_code)
            .copied()
            .unwrap_or(self.fallback)
    }
}
