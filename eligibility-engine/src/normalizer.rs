//! Response normalization.
//!
//! Every provider answer, whatever its protocol, is mapped into one
//! [`EligibilityResult`]. Missing fields are filled with conservative
//! defaults and each substitution is recorded in `defaults_applied`.

use chrono::NaiveDate;
use serde_json::Value;

use crate::adapters::{FhirEligibility, RawProviderResponse, RestPayload, RestShape, SoapEligibility, X12Eligibility};
use crate::error::{EligibilityError, EngineResult};
use crate::models::{AmountWindow, Benefit, DefaultApplied, EligibilityResult};
use crate::procedures::{service_type_code, ProcedureCategory};

pub const DEFAULT_DEDUCTIBLE: AmountWindow = AmountWindow {
    annual: 1500.0,
    remaining: 1200.0,
};
pub const DEFAULT_OUT_OF_POCKET_MAX: AmountWindow = AmountWindow {
    annual: 6000.0,
    remaining: 5000.0,
};

/// Normalize a provider answer for the requested procedure.
pub fn normalize(raw: &RawProviderResponse, procedure_code: &str, today: NaiveDate) -> EngineResult<EligibilityResult> {
    let extracted = match raw {
        RawProviderResponse::Fhir(fhir) => from_fhir(fhir)?,
        RawProviderResponse::X12(x12) => from_x12(x12, procedure_code),
        RawProviderResponse::Soap(soap) => from_soap(soap, procedure_code)?,
        RawProviderResponse::RestJson(payload) => from_rest(payload, procedure_code)?,
    };
    Ok(extracted.finish(procedure_code, today))
}

/// Estimate used when no provider could be reached: coverage is assumed to
/// be in force and every amount comes from the defaults.
pub fn estimated_defaults(procedure_code: &str, today: NaiveDate) -> EligibilityResult {
    Extracted {
        active: true,
        ..Extracted::default()
    }
    .finish(procedure_code, today)
}

#[derive(Debug, Default)]
struct PartialBenefit {
    procedure_code: String,
    coverage_percentage: Option<f64>,
    copay: Option<f64>,
    allowed_amount: Option<f64>,
}

#[derive(Debug, Default)]
struct Extracted {
    active: bool,
    effective_date: Option<NaiveDate>,
    termination_date: Option<NaiveDate>,
    benefits: Vec<PartialBenefit>,
    deductible: (Option<f64>, Option<f64>),
    out_of_pocket: (Option<f64>, Option<f64>),
}

impl Extracted {
    fn finish(self, procedure_code: &str, today: NaiveDate) -> EligibilityResult {
        let mut defaults_applied = Vec::new();

        let effective_date = self.effective_date.unwrap_or_else(|| {
            defaults_applied.push(DefaultApplied::EffectiveDate);
            today
        });

        let deductible = window(self.deductible).unwrap_or_else(|| {
            defaults_applied.push(DefaultApplied::Deductible);
            DEFAULT_DEDUCTIBLE
        });
        let out_of_pocket_max = window(self.out_of_pocket).unwrap_or_else(|| {
            defaults_applied.push(DefaultApplied::OutOfPocketMax);
            DEFAULT_OUT_OF_POCKET_MAX
        });

        let mut benefits: Vec<Benefit> = Vec::with_capacity(self.benefits.len() + 1);
        for partial in self.benefits {
            if benefits.iter().any(|b| b.procedure_code == partial.procedure_code) {
                continue;
            }
            let (default_percentage, default_copay) = ProcedureCategory::of(&partial.procedure_code).default_benefit();
            if partial.coverage_percentage.is_none() && partial.procedure_code == procedure_code {
                defaults_applied.push(DefaultApplied::ProcedureBenefit);
            }
            let copay = match (partial.coverage_percentage, partial.copay) {
                (_, Some(copay)) => copay,
                (None, None) => default_copay,
                (Some(_), None) => 0.0,
            };
            benefits.push(benefit(
                partial.procedure_code,
                partial.coverage_percentage.unwrap_or(default_percentage),
                copay,
                partial.allowed_amount.unwrap_or(0.0),
            ));
        }

        if !benefits.iter().any(|b| b.procedure_code == procedure_code) {
            let (percentage, copay) = ProcedureCategory::of(procedure_code).default_benefit();
            benefits.push(benefit(procedure_code.to_string(), percentage, copay, 0.0));
            defaults_applied.push(DefaultApplied::ProcedureBenefit);
        }

        EligibilityResult {
            active: self.active,
            effective_date,
            termination_date: self.termination_date,
            benefits,
            deductible,
            out_of_pocket_max,
            defaults_applied,
        }
    }
}

fn benefit(procedure_code: String, coverage_percentage: f64, copay: f64, allowed_amount: f64) -> Benefit {
    Benefit {
        procedure_code,
        coverage_percentage: coverage_percentage.clamp(0.0, 100.0),
        copay: copay.max(0.0),
        allowed_amount: allowed_amount.max(0.0),
    }
}

/// A window needs at least one side; the missing side mirrors the other.
fn window((annual, remaining): (Option<f64>, Option<f64>)) -> Option<AmountWindow> {
    match (annual, remaining) {
        (None, None) => None,
        (Some(annual), None) => Some(AmountWindow::new(annual, annual)),
        (None, Some(remaining)) => Some(AmountWindow::new(remaining, remaining)),
        (Some(annual), Some(remaining)) => Some(AmountWindow::new(annual, remaining)),
    }
}

fn from_fhir(fhir: &FhirEligibility) -> EngineResult<Extracted> {
    let coverage = &fhir.coverage;
    Ok(Extracted {
        active: text(coverage, "/status") == Some("active"),
        effective_date: date(coverage, "/period/start")?,
        termination_date: date(coverage, "/period/end")?,
        ..Extracted::default()
    })
}

fn from_x12(x12: &X12Eligibility, procedure_code: &str) -> Extracted {
    let service = x12.service_benefit(service_type_code(procedure_code));
    let coverage_percentage = service
        .and_then(|s| s.coverage_percentage)
        .or(x12.coverage_percentage);
    let copay = service.and_then(|s| s.copay).or(x12.copay);

    let benefits = if coverage_percentage.is_some() || copay.is_some() {
        vec![PartialBenefit {
            procedure_code: procedure_code.to_string(),
            coverage_percentage,
            copay,
            allowed_amount: None,
        }]
    } else {
        Vec::new()
    };

    Extracted {
        active: x12.active,
        effective_date: x12.effective_date,
        termination_date: x12.termination_date,
        benefits,
        deductible: (x12.deductible_annual, x12.deductible_remaining),
        out_of_pocket: (x12.out_of_pocket_annual, x12.out_of_pocket_remaining),
    }
}

fn from_soap(soap: &SoapEligibility, procedure_code: &str) -> EngineResult<Extracted> {
    let status = soap
        .field("Status")
        .ok_or_else(|| EligibilityError::MalformedResponse("SOAP response has no Status".into()))?;
    let effective = soap
        .field("EffectiveDate")
        .ok_or_else(|| EligibilityError::MalformedResponse("SOAP response has no EffectiveDate".into()))?;
    let amount = |name: &str| soap.field(name).map(parse_amount).transpose();

    let mut benefits = Vec::new();
    if let Some(service) = soap.field("ServiceType") {
        if service == procedure_code || service == service_type_code(procedure_code) {
            benefits.push(PartialBenefit {
                procedure_code: procedure_code.to_string(),
                coverage_percentage: amount("CoveragePercent")?,
                copay: amount("Copay")?,
                allowed_amount: None,
            });
        }
    }

    Ok(Extracted {
        active: status.eq_ignore_ascii_case("active"),
        effective_date: Some(parse_date(effective)?),
        termination_date: soap.field("TerminationDate").map(parse_date).transpose()?,
        benefits,
        deductible: (amount("AnnualDeductible")?, amount("RemainingDeductible")?),
        out_of_pocket: (amount("AnnualOOPMax")?, amount("RemainingOOPMax")?),
    })
}

fn from_rest(payload: &RestPayload, procedure_code: &str) -> EngineResult<Extracted> {
    let body = &payload.body;
    match payload.shape {
        RestShape::Bcbs => Ok(Extracted {
            active: required_text(body, "/status")?.eq_ignore_ascii_case("active"),
            effective_date: date(body, "/coverage/startDate")?,
            termination_date: date(body, "/coverage/endDate")?,
            benefits: benefit_list(body, "/benefits", "/code", "/coveragePercent", "/copayAmount", "/estimatedCost")?,
            deductible: (amount(body, "/deductible/yearly")?, amount(body, "/deductible/remaining")?),
            out_of_pocket: (amount(body, "/oopMax/yearly")?, amount(body, "/oopMax/remaining")?),
        }),
        RestShape::United => Ok(Extracted {
            active: required_text(body, "/eligibilityStatus")?.eq_ignore_ascii_case("active"),
            effective_date: date(body, "/planBeginDate")?,
            termination_date: date(body, "/planEndDate")?,
            benefits: benefit_list(body, "/procedures", "/cptCode", "/coveragePercent", "/copay", "/allowedAmount")?,
            deductible: met_window(body, "/deductible")?,
            out_of_pocket: met_window(body, "/outOfPocket")?,
        }),
        RestShape::ChangeHealthcare => {
            let status = required_text(body, "/planInformation/0/status")?;
            let entries = array(body, "/benefitsInformation");
            let benefits = benefit_list(
                body,
                "/benefitsInformation",
                "/procedureCode",
                "/coveragePercentage",
                "/copayAmount",
                "/allowedAmount",
            )?;
            Ok(Extracted {
                active: status == "Active",
                effective_date: date(body, "/planInformation/0/eligibilityBeginDate")?,
                termination_date: date(body, "/planInformation/0/eligibilityEndDate")?,
                benefits,
                deductible: (
                    accumulator(entries, "Deductible", "Annual")?,
                    accumulator(entries, "Deductible", "Remaining")?,
                ),
                out_of_pocket: (
                    accumulator(entries, "Out of Pocket Maximum", "Annual")?,
                    accumulator(entries, "Out of Pocket Maximum", "Remaining")?,
                ),
            })
        }
        RestShape::Waystar => {
            let response = body
                .get("eligibilityResponse")
                .ok_or_else(|| EligibilityError::MalformedResponse("missing eligibilityResponse".into()))?;
            let service_type = service_type_code(procedure_code);
            let mut benefits = benefit_list(
                response,
                "/benefits",
                "/serviceType",
                "/coverageLevel",
                "/copaymentAmount",
                "/allowedAmount",
            )?;
            for entry in &mut benefits {
                if entry.procedure_code == service_type {
                    entry.procedure_code = procedure_code.to_string();
                }
            }
            Ok(Extracted {
                active: required_text(response, "/subscriberEligibility")? == "Eligible",
                effective_date: date(response, "/coverageEffectiveDate")?,
                termination_date: date(response, "/coverageTerminationDate")?,
                benefits,
                deductible: (
                    amount(response, "/deductible/annualAmount")?,
                    amount(response, "/deductible/remainingAmount")?,
                ),
                out_of_pocket: (
                    amount(response, "/outOfPocketMaximum/annualAmount")?,
                    amount(response, "/outOfPocketMaximum/remainingAmount")?,
                ),
            })
        }
        RestShape::Eligible => from_eligible(body, procedure_code),
    }
}

/// Service type codes Eligible uses for dental care in general
const ELIGIBLE_DENTAL_SERVICE_TYPES: [&str; 2] = ["35", "dental"];

fn from_eligible(body: &Value, procedure_code: &str) -> EngineResult<Extracted> {
    let coverage = body
        .get("coverage")
        .ok_or_else(|| EligibilityError::MalformedResponse("missing coverage".into()))?;
    let status = text(coverage, "/eligibility/status")
        .or_else(|| text(coverage, "/subscriber/eligibility/status"))
        .ok_or_else(|| EligibilityError::MalformedResponse("missing eligibility status".into()))?;

    let entries = array(coverage, "/benefits");
    let service_type = service_type_code(procedure_code);
    let matching = entries
        .iter()
        .find(|b| text(b, "/procedure_code") == Some(procedure_code))
        .or_else(|| entries.iter().find(|b| text(b, "/service_type") == Some(service_type)))
        .or_else(|| {
            entries
                .iter()
                .find(|b| text(b, "/service_type").is_some_and(|st| ELIGIBLE_DENTAL_SERVICE_TYPES.contains(&st)))
        });

    let benefits = match matching {
        Some(entry) => {
            let coverage_percentage = if text(entry, "/insurance_type_code") == Some("HM") {
                Some(100.0)
            } else {
                amount(entry, "/coinsurance_percent")?.map(|share| 100.0 - share)
            };
            let copay = match amount(entry, "/copayment/amount")? {
                Some(copay) => Some(copay),
                None => amount(entry, "/copay")?,
            };
            vec![PartialBenefit {
                procedure_code: procedure_code.to_string(),
                coverage_percentage,
                copay,
                allowed_amount: None,
            }]
        }
        None => Vec::new(),
    };

    Ok(Extracted {
        active: status.eq_ignore_ascii_case("active") || status == "1",
        effective_date: eligible_date(coverage, "effective")?,
        termination_date: eligible_date(coverage, "termination")?,
        benefits,
        deductible: eligible_accumulator(entries, "deductible")?,
        out_of_pocket: eligible_accumulator(entries, "out_of_pocket")?,
    })
}

/// Plan-level date, falling back to the subscriber's own eligibility dates
fn eligible_date(coverage: &Value, field: &str) -> EngineResult<Option<NaiveDate>> {
    for scope in ["/eligibility", "/subscriber/eligibility"] {
        if let Some(found) = date(coverage, &format!("{scope}/dates/{field}"))? {
            return Ok(Some(found));
        }
    }
    Ok(None)
}

/// `{amount, remaining}` block carried by the first benefit that has one
fn eligible_accumulator(entries: &[Value], name: &str) -> EngineResult<(Option<f64>, Option<f64>)> {
    let Some(block) = entries.iter().find_map(|b| b.get(name)) else {
        return Ok((None, None));
    };
    Ok((amount(block, "/amount")?, amount(block, "/remaining")?))
}

fn text<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn required_text<'a>(value: &'a Value, pointer: &str) -> EngineResult<&'a str> {
    text(value, pointer).ok_or_else(|| EligibilityError::MalformedResponse(format!("missing field {pointer}")))
}

fn array<'a>(value: &'a Value, pointer: &str) -> &'a [Value] {
    value
        .pointer(pointer)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn amount(value: &Value, pointer: &str) -> EngineResult<Option<f64>> {
    match value.pointer(pointer) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => parse_amount(s).map(Some),
        Some(_) => Err(EligibilityError::MalformedResponse(format!("non-numeric field {pointer}"))),
    }
}

fn date(value: &Value, pointer: &str) -> EngineResult<Option<NaiveDate>> {
    text(value, pointer).map(parse_date).transpose()
}

fn parse_amount(value: &str) -> EngineResult<f64> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| EligibilityError::MalformedResponse(format!("invalid amount {value}")))
}

/// Accepts `YYYY-MM-DD`, an RFC 3339 timestamp or `YYYYMMDD`.
fn parse_date(value: &str) -> EngineResult<NaiveDate> {
    let value = value.trim();
    let iso = value.get(..10).filter(|d| d.as_bytes().get(4) == Some(&b'-'));
    iso.map_or_else(
        || NaiveDate::parse_from_str(value, "%Y%m%d"),
        |d| NaiveDate::parse_from_str(d, "%Y-%m-%d"),
    )
    .map_err(|_| EligibilityError::MalformedResponse(format!("invalid date {value}")))
}

fn benefit_list(
    body: &Value,
    list: &str,
    code: &str,
    percentage: &str,
    copay: &str,
    allowed: &str,
) -> EngineResult<Vec<PartialBenefit>> {
    array(body, list)
        .iter()
        .filter_map(|entry| text(entry, code).map(|c| (entry, c)))
        .map(|(entry, procedure_code)| {
            Ok(PartialBenefit {
                procedure_code: procedure_code.to_string(),
                coverage_percentage: amount(entry, percentage)?,
                copay: amount(entry, copay)?,
                allowed_amount: amount(entry, allowed)?,
            })
        })
        .collect()
}

/// Individual-level accumulator from a clearinghouse benefit list
fn accumulator(entries: &[Value], name: &str, period: &str) -> EngineResult<Option<f64>> {
    entries
        .iter()
        .find(|e| {
            text(e, "/name") == Some(name)
                && text(e, "/coverageLevelCode") == Some("IND")
                && text(e, "/timePeriodQualifier") == Some(period)
        })
        .map_or(Ok(None), |e| amount(e, "/benefitAmount"))
}

/// `{annual, met}` accumulator; remaining is what has not been met yet.
fn met_window(body: &Value, pointer: &str) -> EngineResult<(Option<f64>, Option<f64>)> {
    let annual = amount(body, &format!("{pointer}/annual"))?;
    let met = amount(body, &format!("{pointer}/met"))?;
    let remaining = annual.zip(met).map(|(annual, met)| annual - met);
    Ok((annual, remaining))
}
