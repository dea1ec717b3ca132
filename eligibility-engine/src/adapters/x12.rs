//! X12 270/271 eligibility codec and adapter.
//!
//! Outbound inquiries are assembled segment by segment with a computed
//! transaction segment count. Inbound 271 responses are structurally
//! validated before any benefit segment is read.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, instrument};

use super::{ProtocolAdapter, RawProviderResponse};
use crate::directory::{ProtocolVariant, ProviderProfile};
use crate::error::{EligibilityError, EngineResult};
use crate::models::EligibilityQuery;
use crate::procedures::service_type_code;

pub const SEGMENT_TERMINATOR: char = '~';
pub const ELEMENT_SEPARATOR: char = '*';
pub const IMPLEMENTATION_REFERENCE: &str = "005010X279A1";

/// Control numbers are nine digits and wrap.
const CONTROL_NUMBER_MODULUS: u32 = 1_000_000_000;
/// Health benefit plan coverage
const PLAN_COVERAGE_SERVICE_TYPE: &str = "30";
/// Time period qualifier for amounts still available
const REMAINING_PERIOD: &str = "29";

/// Interchange identity of the submitter
#[derive(Debug, Clone)]
pub struct InterchangeSender {
    pub sender_id: String,
    pub submitter_npi: String,
}

/// Build a 270 inquiry for the query.
pub fn build_inquiry(
    query: &EligibilityQuery,
    sender: &InterchangeSender,
    control_number: u32,
    at: DateTime<Utc>,
) -> String {
    let group = control_number % CONTROL_NUMBER_MODULUS;
    let control = format!("{group:09}");
    let sender_id = clean(&sender.sender_id);
    let payer_id = clean(&query.payer_id);
    let yymmdd = at.format("%y%m%d").to_string();
    let ccyymmdd = at.format("%Y%m%d").to_string();
    let hhmm = at.format("%H%M").to_string();

    let transaction = vec![
        format!("ST*270*0001*{IMPLEMENTATION_REFERENCE}"),
        format!("BHT*0022*13*{control}*{ccyymmdd}*{hhmm}"),
        "HL*1**20*1".to_string(),
        format!("NM1*PR*2*{payer_id}*****PI*{payer_id}"),
        "HL*2*1*21*1".to_string(),
        format!("NM1*1P*2*{sender_id}*****XX*{}", clean(&sender.submitter_npi)),
        "HL*3*2*22*0".to_string(),
        format!("TRN*1*{control}*{sender_id}"),
        format!(
            "NM1*IL*1*{}*{}****MI*{}",
            clean(&query.patient.last_name),
            clean(&query.patient.first_name),
            clean(&query.member_id)
        ),
        format!("DMG*D8*{}", query.patient.dob.format("%Y%m%d")),
        format!("EQ*{PLAN_COVERAGE_SERVICE_TYPE}"),
        format!("EQ*{}", service_type_code(&query.procedure_code)),
    ];
    let segment_count = transaction.len() + 1;

    let mut segments = Vec::with_capacity(transaction.len() + 5);
    segments.push(format!(
        "ISA*00*{:10}*00*{:10}*ZZ*{:<15.15}*ZZ*{:<15.15}*{yymmdd}*{hhmm}*^*00501*{control}*0*P*:",
        "", "", sender_id, payer_id
    ));
    segments.push(format!(
        "GS*HS*{sender_id}*{payer_id}*{ccyymmdd}*{hhmm}*{group}*X*{IMPLEMENTATION_REFERENCE}"
    ));
    segments.extend(transaction);
    segments.push(format!("SE*{segment_count}*0001"));
    segments.push(format!("GE*1*{group}"));
    segments.push(format!("IEA*1*{control}"));

    let mut message = segments.join(&SEGMENT_TERMINATOR.to_string());
    message.push(SEGMENT_TERMINATOR);
    message
}

/// Strip delimiter characters from a caller-supplied element value.
fn clean(value: &str) -> String {
    value
        .chars()
        .filter(|c| !matches!(c, '*' | '~' | ':' | '^'))
        .collect::<String>()
        .trim()
        .to_string()
}

fn segments(message: &str) -> impl Iterator<Item = Vec<&str>> {
    message
        .split(SEGMENT_TERMINATOR)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.split(ELEMENT_SEPARATOR).collect())
}

fn element<'a>(segment: &[&'a str], index: usize) -> Option<&'a str> {
    segment.get(index).copied().filter(|v| !v.is_empty())
}

/// Check envelope structure, collecting every violation.
pub fn validate_structure(message: &str) -> EngineResult<()> {
    let mut errors = Vec::new();
    let trimmed = message.trim();

    if !trimmed.starts_with("ISA") {
        errors.push("Missing interchange header (ISA)".to_string());
    }
    if !trimmed.ends_with(SEGMENT_TERMINATOR) {
        errors.push("Message does not end with a segment terminator".to_string());
    }

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for segment in segments(trimmed) {
        if let Some(id) = segment.first() {
            *counts.entry(*id).or_default() += 1;
        }
    }
    let count = |id: &str| counts.get(id).copied().unwrap_or(0);

    if count("IEA") == 0 {
        errors.push("Missing interchange trailer (IEA)".to_string());
    }
    let envelopes = [
        ("ISA", "IEA", "interchange"),
        ("GS", "GE", "functional group"),
        ("ST", "SE", "transaction set"),
    ];
    for (header, trailer, name) in envelopes {
        if count(header) != count(trailer) {
            errors.push(format!(
                "Unbalanced {name}: {} {header} vs {} {trailer}",
                count(header),
                count(trailer)
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(EligibilityError::StructuralParseFailure(errors))
    }
}

/// Coverage details for one service type
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ServiceBenefit {
    pub service_type: String,
    pub coverage_percentage: Option<f64>,
    pub copay: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Subscriber {
    pub last_name: Option<String>,
    pub first_name: Option<String>,
    pub member_id: Option<String>,
}

/// Fields extracted from a 271 response
#[derive(Debug, Clone, PartialEq, Default)]
pub struct X12Eligibility {
    pub subscriber: Subscriber,
    pub active: bool,
    pub effective_date: Option<NaiveDate>,
    pub termination_date: Option<NaiveDate>,
    pub deductible_annual: Option<f64>,
    pub deductible_remaining: Option<f64>,
    pub out_of_pocket_annual: Option<f64>,
    pub out_of_pocket_remaining: Option<f64>,
    /// Plan-level coinsurance and copay, not tied to a service type
    pub coverage_percentage: Option<f64>,
    pub copay: Option<f64>,
    pub service_benefits: Vec<ServiceBenefit>,
    pub messages: Vec<String>,
}

impl X12Eligibility {
    pub fn service_benefit(&self, service_type: &str) -> Option<&ServiceBenefit> {
        self.service_benefits.iter().find(|b| b.service_type == service_type)
    }

    /// Apply `update` to the benefit for `service_type`, creating it first if needed.
    fn update_service_benefit(&mut self, service_type: &str, update: impl FnOnce(&mut ServiceBenefit)) {
        match self.service_benefits.iter_mut().find(|b| b.service_type == service_type) {
            Some(benefit) => update(benefit),
            None => {
                let mut benefit = ServiceBenefit {
                    service_type: service_type.to_string(),
                    ..ServiceBenefit::default()
                };
                update(&mut benefit);
                self.service_benefits.push(benefit);
            }
        }
    }
}

/// Parse a 271 response. `today` decides activity when no explicit
/// active/inactive benefit is present.
pub fn parse_response(message: &str, today: NaiveDate) -> EngineResult<X12Eligibility> {
    validate_structure(message)?;

    let mut result = X12Eligibility::default();
    let mut coverage_flag: Option<bool> = None;

    for segment in segments(message) {
        match segment.first().copied() {
            Some("NM1") if element(&segment, 1) == Some("IL") => {
                result.subscriber = Subscriber {
                    last_name: element(&segment, 3).map(str::to_string),
                    first_name: element(&segment, 4).map(str::to_string),
                    member_id: element(&segment, 9).map(str::to_string),
                };
            }
            Some("DTP") => parse_date_segment(&segment, &mut result)?,
            Some("EB") => parse_benefit_segment(&segment, &mut result, &mut coverage_flag)?,
            Some("MSG") => {
                if let Some(text) = element(&segment, 1) {
                    result.messages.push(text.to_string());
                }
            }
            _ => {}
        }
    }

    result.active = coverage_flag.unwrap_or_else(|| {
        result.effective_date.is_some_and(|start| {
            start <= today && result.termination_date.map_or(true, |end| today <= end)
        })
    });
    Ok(result)
}

fn parse_date_segment(segment: &[&str], result: &mut X12Eligibility) -> EngineResult<()> {
    let qualifier = element(segment, 1);
    let format = element(segment, 2);
    let Some(value) = element(segment, 3) else {
        return Ok(());
    };
    match (qualifier, format) {
        (Some("291"), Some("RD8")) => {
            let (start, end) = value
                .split_once('-')
                .ok_or_else(|| EligibilityError::MalformedResponse(format!("invalid date range {value}")))?;
            result.effective_date = Some(parse_date(start)?);
            result.termination_date = Some(parse_date(end)?);
        }
        (Some("291"), _) => result.effective_date = Some(parse_date(value)?),
        (Some("292"), _) => result.termination_date = Some(parse_date(value)?),
        _ => {}
    }
    Ok(())
}

fn parse_date(value: &str) -> EngineResult<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y%m%d")
        .map_err(|_| EligibilityError::MalformedResponse(format!("invalid D8 date {value}")))
}

fn parse_amount(value: &str) -> EngineResult<f64> {
    value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| EligibilityError::MalformedResponse(format!("invalid monetary amount {value}")))
}

fn parse_benefit_segment(
    segment: &[&str],
    result: &mut X12Eligibility,
    coverage_flag: &mut Option<bool>,
) -> EngineResult<()> {
    let code = element(segment, 1);
    let individual = element(segment, 2).map_or(true, |level| level == "IND");
    let service_type = element(segment, 3);
    let remaining = element(segment, 6) == Some(REMAINING_PERIOD);
    let amount = element(segment, 7).map(parse_amount).transpose()?;
    let percent = element(segment, 8).map(parse_amount).transpose()?;

    match code {
        Some("1") => *coverage_flag = Some(true),
        Some("6") => {
            if *coverage_flag != Some(true) {
                *coverage_flag = Some(false);
            }
        }
        Some("C") if individual => {
            if remaining {
                result.deductible_remaining = amount.or(result.deductible_remaining);
            } else {
                result.deductible_annual = amount.or(result.deductible_annual);
            }
        }
        Some("G") if individual => {
            if remaining {
                result.out_of_pocket_remaining = amount.or(result.out_of_pocket_remaining);
            } else {
                result.out_of_pocket_annual = amount.or(result.out_of_pocket_annual);
            }
        }
        Some("A") if individual => {
            // EB08 carries the patient's share, either as a fraction or a percent.
            if let Some(share) = percent {
                let share = if share <= 1.0 { share * 100.0 } else { share };
                let coverage = (100.0 - share).clamp(0.0, 100.0);
                match service_type {
                    Some(st) => result.update_service_benefit(st, |b| b.coverage_percentage = Some(coverage)),
                    None => result.coverage_percentage = Some(coverage),
                }
            }
        }
        Some("B") if individual => {
            if let Some(copay) = amount {
                match service_type {
                    Some(st) => result.update_service_benefit(st, |b| b.copay = Some(copay)),
                    None => result.copay = Some(copay),
                }
            }
        }
        _ => {}
    }
    Ok(())
}

/// Channel that carries 270 inquiries to a payer and returns the 271.
#[async_trait]
pub trait EdiTransport: Send + Sync {
    async fn exchange(&self, provider: &ProviderProfile, inquiry: String) -> EngineResult<String>;
}

/// Transport used when no EDI channel is configured. Always unavailable,
/// so the orchestrator moves on to the next channel.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnroutedTransport;

#[async_trait]
impl EdiTransport for UnroutedTransport {
    async fn exchange(&self, provider: &ProviderProfile, _inquiry: String) -> EngineResult<String> {
        Err(EligibilityError::TransportUnavailable(format!(
            "no EDI channel configured for {}",
            provider.id
        )))
    }
}

pub struct X12Adapter {
    transport: Arc<dyn EdiTransport>,
    sender: InterchangeSender,
    next_control: AtomicU32,
}

impl X12Adapter {
    pub fn new(transport: Arc<dyn EdiTransport>, sender: InterchangeSender) -> Self {
        let seed = Utc::now().timestamp_millis().rem_euclid(i64::from(CONTROL_NUMBER_MODULUS));
        Self {
            transport,
            sender,
            next_control: AtomicU32::new(u32::try_from(seed).unwrap_or(1)),
        }
    }

    fn control_number(&self) -> u32 {
        self.next_control.fetch_add(1, Ordering::Relaxed) % CONTROL_NUMBER_MODULUS
    }
}

#[async_trait]
impl ProtocolAdapter for X12Adapter {
    fn protocol(&self) -> ProtocolVariant {
        ProtocolVariant::X12
    }

    #[instrument(skip_all, fields(provider_id = %provider.id))]
    async fn query_eligibility(
        &self,
        provider: &ProviderProfile,
        query: &EligibilityQuery,
    ) -> EngineResult<RawProviderResponse> {
        let now = Utc::now();
        let inquiry = build_inquiry(query, &self.sender, self.control_number(), now);
        let response = self.transport.exchange(provider, inquiry).await?;
        debug!(bytes = response.len(), "Received 271 response");
        let parsed = parse_response(&response, now.date_naive())?;
        Ok(RawProviderResponse::X12(parsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PatientDemographics;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn query(procedure: &str) -> EligibilityQuery {
        EligibilityQuery {
            payer_id: "delta_dental".into(),
            member_id: "W123*456".into(),
            procedure_code: procedure.into(),
            patient: PatientDemographics {
                first_name: "Jane".into(),
                last_name: "Doe".into(),
                dob: NaiveDate::from_ymd_opt(1985, 4, 12).unwrap(),
            },
            requesting_provider_id: "1234567890".into(),
        }
    }

    fn sender() -> InterchangeSender {
        InterchangeSender {
            sender_id: "CLEARVERIFY".into(),
            submitter_npi: "1234567890".into(),
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    const RESPONSE_271: &str = "ISA*00*          *00*          *ZZ*DELTA          *ZZ*CLEARVERIFY    *240601*1200*^*00501*000000042*0*P*:~\
GS*HB*DELTA*CLEARVERIFY*20240601*1200*42*X*005010X279A1~\
ST*271*0001*005010X279A1~\
NM1*IL*1*DOE*JANE****MI*W123~\
DTP*291*D8*20240101~\
EB*1**30~\
EB*C*IND*30***23*1500~\
EB*C*IND*30***29*900~\
EB*C*FAM*30***23*4500~\
EB*G*IND*30***23*6000~\
EB*G*IND*30***29*5000~\
EB*A*IND*23*****0~\
EB*A*IND*25*****.2~\
EB*B*IND*25***27*15~\
MSG*Coverage subject to frequency limits~\
SE*14*0001~\
GE*1*42~\
IEA*1*000000042~";

    #[test]
    fn test_inquiry_structure_and_segment_count() {
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 9, 30, 0).unwrap();
        let message = build_inquiry(&query("D2391"), &sender(), 42, at);

        assert!(message.starts_with("ISA*00*"));
        assert!(message.ends_with('~'));
        assert!(message.contains("*000000042*0*P*:~"));
        assert!(message.contains("GS*HS*CLEARVERIFY*delta_dental*20240601*0930*42*X*005010X279A1~"));
        assert!(message.contains("NM1*IL*1*Doe*Jane****MI*W123456~"));
        assert!(message.contains("DMG*D8*19850412~"));
        assert!(message.contains("EQ*30~EQ*25~"));
        assert!(message.contains("SE*13*0001~"));
        assert!(message.contains("IEA*1*000000042~"));
        validate_structure(&message).unwrap();

        let segment_count = message
            .split('~')
            .skip_while(|s| !s.starts_with("ST*"))
            .take_while(|s| !s.starts_with("GE*"))
            .count();
        assert_eq!(segment_count, 13);
    }

    #[test]
    fn test_unknown_procedure_uses_general_dental() {
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 9, 30, 0).unwrap();
        let message = build_inquiry(&query("D9999"), &sender(), 7, at);
        assert!(message.contains("EQ*35~"));
    }

    #[test]
    fn test_parse_271() {
        let parsed = parse_response(RESPONSE_271, today()).unwrap();
        assert!(parsed.active);
        assert_eq!(parsed.subscriber.member_id.as_deref(), Some("W123"));
        assert_eq!(parsed.effective_date, NaiveDate::from_ymd_opt(2024, 1, 1));
        assert_eq!(parsed.deductible_annual, Some(1500.0));
        assert_eq!(parsed.deductible_remaining, Some(900.0));
        assert_eq!(parsed.out_of_pocket_annual, Some(6000.0));
        assert_eq!(parsed.out_of_pocket_remaining, Some(5000.0));

        let preventive = parsed.service_benefit("23").unwrap();
        assert_eq!(preventive.coverage_percentage, Some(100.0));
        let basic = parsed.service_benefit("25").unwrap();
        assert_eq!(basic.coverage_percentage, Some(80.0));
        assert_eq!(basic.copay, Some(15.0));
        assert_eq!(parsed.messages, vec!["Coverage subject to frequency limits".to_string()]);
    }

    #[test]
    fn test_inactive_flag_wins_over_dates() {
        let message = RESPONSE_271.replace("EB*1**30~", "EB*6**30~");
        let parsed = parse_response(&message, today()).unwrap();
        assert!(!parsed.active);
    }

    #[test]
    fn test_activity_from_dates_without_flag() {
        let message = RESPONSE_271
            .replace("EB*1**30~", "")
            .replace("DTP*291*D8*20240101~", "DTP*291*RD8*20240101-20240301~");
        let parsed = parse_response(&message, today()).unwrap();
        assert_eq!(parsed.termination_date, NaiveDate::from_ymd_opt(2024, 3, 1));
        assert!(!parsed.active);
    }

    #[test]
    fn test_missing_header_is_rejected_before_benefits() {
        let message = RESPONSE_271
            .split_once('~')
            .map(|(_, rest)| rest.to_string())
            .unwrap();
        let err = parse_response(&message, today()).unwrap_err();
        match err {
            EligibilityError::StructuralParseFailure(errors) => {
                assert!(errors.iter().any(|e| e.contains("ISA")));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_unbalanced_transaction_and_missing_terminator() {
        let message = RESPONSE_271.replace("SE*14*0001~", "");
        let message = message.trim_end_matches('~');
        let err = validate_structure(message).unwrap_err();
        match err {
            EligibilityError::StructuralParseFailure(errors) => {
                assert!(errors.iter().any(|e| e.contains("transaction set")));
                assert!(errors.iter().any(|e| e.contains("terminator")));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_non_finite_amounts_are_malformed() {
        for bad in ["NaN", "inf", "-infinity"] {
            let message = RESPONSE_271.replace("*29*900~", &format!("*29*{bad}~"));
            assert!(
                matches!(parse_response(&message, today()), Err(EligibilityError::MalformedResponse(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_bad_amount_is_malformed() {
        let message = RESPONSE_271.replace("*29*900~", "*29*nine~");
        assert!(matches!(
            parse_response(&message, today()),
            Err(EligibilityError::MalformedResponse(_))
        ));
    }

    /// Turn an inquiry into the payer's answer: same envelope and entities,
    /// plus a plan window.
    fn respond_to(inquiry: &str, window: &str) -> String {
        let mut segments: Vec<String> = inquiry
            .split(SEGMENT_TERMINATOR)
            .filter(|s| !s.is_empty())
            .map(|s| s.replace("ST*270*", "ST*271*"))
            .collect();
        let after_demographics = segments.iter().position(|s| s.starts_with("DMG*")).unwrap() + 1;
        segments.insert(after_demographics, format!("DTP*291*RD8*{window}"));
        let count = segments
            .iter()
            .skip_while(|s| !s.starts_with("ST*"))
            .take_while(|s| !s.starts_with("GE*"))
            .count();
        let trailer = segments.iter_mut().find(|s| s.starts_with("SE*")).unwrap();
        *trailer = format!("SE*{count}*0001");
        format!("{}~", segments.join("~"))
    }

    proptest! {
        #[test]
        fn prop_inquiry_identity_survives_response(
            first in "[A-Z][a-z]{1,10}",
            last in "[A-Z][a-z]{1,12}",
            member in "[A-Z0-9]{4,12}",
            start_offset in 0i64..3650,
            length in 1i64..730,
        ) {
            let mut request = query("D2391");
            request.patient.first_name = first.clone();
            request.patient.last_name = last.clone();
            request.member_id = member.clone();
            let at = Utc.with_ymd_and_hms(2024, 6, 1, 9, 30, 0).unwrap();
            let inquiry = build_inquiry(&request, &sender(), 1, at);

            let start = NaiveDate::from_ymd_opt(2015, 1, 1).unwrap() + chrono::Duration::days(start_offset);
            let end = start + chrono::Duration::days(length);
            let window = format!("{}-{}", start.format("%Y%m%d"), end.format("%Y%m%d"));
            let parsed = parse_response(&respond_to(&inquiry, &window), today()).unwrap();

            prop_assert_eq!(parsed.subscriber.first_name, Some(first));
            prop_assert_eq!(parsed.subscriber.last_name, Some(last));
            prop_assert_eq!(parsed.subscriber.member_id, Some(member));
            prop_assert_eq!(parsed.effective_date, Some(start));
            prop_assert_eq!(parsed.termination_date, Some(end));
            prop_assert_eq!(parsed.active, start <= today() && today() <= end);
        }
    }

    struct EchoTransport;

    #[async_trait]
    impl EdiTransport for EchoTransport {
        async fn exchange(&self, _provider: &ProviderProfile, inquiry: String) -> EngineResult<String> {
            assert!(inquiry.contains("ST*270*0001"));
            Ok(RESPONSE_271.to_string())
        }
    }

    #[tokio::test]
    async fn test_adapter_round_trips_through_transport() {
        let adapter = X12Adapter::new(Arc::new(EchoTransport), sender());
        let provider = ProviderProfile::new(
            "delta_dental",
            "Delta Dental",
            ProtocolVariant::X12,
            crate::directory::AuthScheme::ApiKey,
            "https://edi.example.test",
        );
        let raw = adapter.query_eligibility(&provider, &query("D0120")).await.unwrap();
        assert_eq!(raw.protocol(), ProtocolVariant::X12);
    }

    #[tokio::test]
    async fn test_unrouted_transport_is_unavailable() {
        let adapter = X12Adapter::new(Arc::new(UnroutedTransport), sender());
        let provider = ProviderProfile::new(
            "metlife",
            "MetLife",
            ProtocolVariant::X12,
            crate::directory::AuthScheme::ApiKey,
            "https://edi.example.test",
        );
        let err = adapter.query_eligibility(&provider, &query("D0120")).await.unwrap_err();
        assert!(err.is_transient());
    }
}
