use crate::models::{Benefit, CoverageDecision, EligibilityResult};
use crate::procedures::ProcedureCategory;

/// Round a currency amount to cents.
pub fn round_currency(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

/// Estimate what the patient pays for one procedure.
///
/// The deductible is consumed first, coinsurance applies to the rest, the
/// copay is added on top and the total is capped at the remaining
/// out-of-pocket maximum. Inactive coverage means the patient pays the full
/// procedure cost.
pub fn estimate(eligibility: &EligibilityResult, procedure_code: &str, procedure_cost: f64) -> CoverageDecision {
    let procedure_cost = procedure_cost.max(0.0);
    let benefit = eligibility
        .benefit_for(procedure_code)
        .cloned()
        .unwrap_or_else(|| category_benefit(procedure_code));

    if !eligibility.active {
        return CoverageDecision {
            is_procedure_covered: false,
            coverage_percentage: 0.0,
            copay: 0.0,
            procedure_cost: round_currency(procedure_cost),
            estimated_patient_cost: round_currency(procedure_cost),
        };
    }

    let patient_cost = patient_responsibility(
        procedure_cost,
        eligibility.deductible.remaining,
        benefit.coverage_percentage,
        benefit.copay,
        eligibility.out_of_pocket_max.remaining,
    );

    CoverageDecision {
        is_procedure_covered: benefit.coverage_percentage > 0.0,
        coverage_percentage: benefit.coverage_percentage,
        copay: benefit.copay,
        procedure_cost: round_currency(procedure_cost),
        estimated_patient_cost: patient_cost,
    }
}

/// Patient share for an active plan, rounded to cents.
pub fn patient_responsibility(
    cost: f64,
    deductible_remaining: f64,
    coverage_percentage: f64,
    copay: f64,
    out_of_pocket_remaining: f64,
) -> f64 {
    let cost = cost.max(0.0);
    let deductible_portion = deductible_remaining.max(0.0).min(cost);
    let after_deductible = cost - deductible_portion;
    let coinsurance = after_deductible * (100.0 - coverage_percentage.clamp(0.0, 100.0)) / 100.0;
    let total = deductible_portion + coinsurance + copay.max(0.0);
    round_currency(total.min(out_of_pocket_remaining.max(0.0)).max(0.0))
}

/// Cost a decision when only the fee schedule is known.
pub fn full_cost(procedure_cost: f64) -> CoverageDecision {
    let cost = round_currency(procedure_cost.max(0.0));
    CoverageDecision {
        is_procedure_covered: false,
        coverage_percentage: 0.0,
        copay: 0.0,
        procedure_cost: cost,
        estimated_patient_cost: cost,
    }
}

fn category_benefit(procedure_code: &str) -> Benefit {
    let (coverage_percentage, copay) = ProcedureCategory::of(procedure_code).default_benefit();
    Benefit {
        procedure_code: procedure_code.to_string(),
        coverage_percentage,
        copay,
        allowed_amount: 0.0,
    }
}
