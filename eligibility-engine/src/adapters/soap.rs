use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::ExposeSecret;
use tracing::instrument;

use super::{send_authenticated, ProtocolAdapter, RawProviderResponse};
use crate::credentials::{AuthMaterial, CredentialBroker};
use crate::directory::{ProtocolVariant, ProviderProfile};
use crate::error::{EligibilityError, EngineResult};
use crate::models::EligibilityQuery;
use crate::procedures::service_type_code;

const DEFAULT_SOAP_ACTION: &str = "RealTimeTransaction";
const DEFAULT_PATH: &str = "/rtx/eligibility";
const RESPONSE_ELEMENT: &str = "EligibilityResponse";

/// Child elements of the `EligibilityResponse` body node, by local name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SoapEligibility {
    fields: BTreeMap<String, String>,
}

impl SoapEligibility {
    pub fn from_fields<I, K, V>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str).filter(|v| !v.is_empty())
    }
}

/// Real-time eligibility over a SOAP envelope
pub struct SoapAdapter {
    http: Client,
    broker: Arc<CredentialBroker>,
}

impl SoapAdapter {
    pub fn new(http: Client, broker: Arc<CredentialBroker>) -> Self {
        Self { http, broker }
    }
}

#[async_trait]
impl ProtocolAdapter for SoapAdapter {
    fn protocol(&self) -> ProtocolVariant {
        ProtocolVariant::Soap
    }

    #[instrument(skip_all, fields(provider_id = %provider.id))]
    async fn query_eligibility(
        &self,
        provider: &ProviderProfile,
        query: &EligibilityQuery,
    ) -> EngineResult<RawProviderResponse> {
        let url = provider.url(provider.endpoints.eligibility.as_deref().unwrap_or(DEFAULT_PATH));
        let action = provider.soap_action.as_deref().unwrap_or(DEFAULT_SOAP_ACTION);

        let response = send_authenticated(&self.broker, provider, |auth| {
            auth.apply(self.http.post(&url))
                .header(reqwest::header::CONTENT_TYPE, "text/xml; charset=utf-8")
                .header("SOAPAction", action)
                .body(build_envelope(query, auth))
        })
        .await?;
        let body = response.text().await?;
        Ok(RawProviderResponse::Soap(parse_envelope(&body)?))
    }
}

/// Build the request envelope. Basic credentials travel in a WS-Security
/// UsernameToken as well as the transport header.
pub fn build_envelope(query: &EligibilityQuery, auth: &AuthMaterial) -> String {
    let security = match auth {
        AuthMaterial::Basic { username, password } => format!(
            "<soap:Header><wsse:Security xmlns:wsse=\"http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd\">\
<wsse:UsernameToken><wsse:Username>{}</wsse:Username><wsse:Password>{}</wsse:Password></wsse:UsernameToken>\
</wsse:Security></soap:Header>",
            xml_escape(username),
            xml_escape(password.expose_secret())
        ),
        _ => String::new(),
    };

    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
<soap:Envelope xmlns:soap=\"http://schemas.xmlsoap.org/soap/envelope/\">{security}<soap:Body>\
<RealTimeTransaction xmlns=\"http://availity.com/rtx\">\
<PayerID>{}</PayerID><ProviderID>{}</ProviderID>\
<PatientFirstName>{}</PatientFirstName><PatientLastName>{}</PatientLastName>\
<PatientDOB>{}</PatientDOB><MemberID>{}</MemberID><ServiceType>{}</ServiceType>\
</RealTimeTransaction></soap:Body></soap:Envelope>",
        xml_escape(&query.payer_id),
        xml_escape(&query.requesting_provider_id),
        xml_escape(&query.patient.first_name),
        xml_escape(&query.patient.last_name),
        query.patient.dob.format("%Y-%m-%d"),
        xml_escape(&query.member_id),
        service_type_code(&query.procedure_code),
    )
}

/// Extract the `EligibilityResponse` node from a response envelope.
pub fn parse_envelope(xml: &str) -> EngineResult<SoapEligibility> {
    let document = roxmltree::Document::parse(xml)
        .map_err(|e| EligibilityError::MalformedResponse(format!("invalid SOAP XML: {e}")))?;

    if let Some(fault) = document.descendants().find(|n| n.tag_name().name() == "Fault") {
        let reason = fault
            .descendants()
            .find(|n| n.tag_name().name() == "faultstring")
            .and_then(|n| n.text())
            .unwrap_or("unspecified fault");
        return Err(EligibilityError::MalformedResponse(format!("SOAP fault: {}", reason.trim())));
    }

    let node = document
        .descendants()
        .find(|n| n.tag_name().name() == RESPONSE_ELEMENT)
        .ok_or_else(|| EligibilityError::MalformedResponse(format!("missing {RESPONSE_ELEMENT} element")))?;

    let fields = node
        .children()
        .filter(roxmltree::Node::is_element)
        .map(|child| {
            (
                child.tag_name().name().to_string(),
                child.text().map(str::trim).unwrap_or_default().to_string(),
            )
        });
    Ok(SoapEligibility::from_fields(fields))
}

fn xml_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            other => escaped.push(other),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{SecretKind, StaticCredentialStore};
    use crate::directory::AuthScheme;
    use crate::models::PatientDemographics;
    use chrono::NaiveDate;
    use mockito::Matcher;
    use secrecy::SecretString;

    const RESPONSE: &str = r#"<?xml version="1.0"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body>
    <EligibilityResponse xmlns="http://availity.com/rtx">
      <Status>Active</Status>
      <EffectiveDate>2024-01-01</EffectiveDate>
      <ServiceType>23</ServiceType>
      <CoveragePercent>100</CoveragePercent>
      <Copay>0</Copay>
      <AnnualDeductible>1500</AnnualDeductible>
      <RemainingDeductible>900</RemainingDeductible>
    </EligibilityResponse>
  </soap:Body>
</soap:Envelope>"#;

    fn query() -> EligibilityQuery {
        EligibilityQuery {
            payer_id: "aetna".into(),
            member_id: "M<1>".into(),
            procedure_code: "D0120".into(),
            patient: PatientDemographics {
                first_name: "Jane".into(),
                last_name: "O'Doe".into(),
                dob: NaiveDate::from_ymd_opt(1985, 4, 12).unwrap(),
            },
            requesting_provider_id: "1234567890".into(),
        }
    }

    #[test]
    fn test_envelope_escapes_values_and_carries_token() {
        let auth = AuthMaterial::Basic {
            username: "svc".into(),
            password: Arc::new(SecretString::new("p&ss".into())),
        };
        let envelope = build_envelope(&query(), &auth);
        assert!(envelope.contains("<MemberID>M&lt;1&gt;</MemberID>"));
        assert!(envelope.contains("<PatientLastName>O&apos;Doe</PatientLastName>"));
        assert!(envelope.contains("<wsse:Password>p&amp;ss</wsse:Password>"));
        assert!(envelope.contains("<ServiceType>23</ServiceType>"));
        roxmltree::Document::parse(&envelope).unwrap();
    }

    #[test]
    fn test_parse_response_fields() {
        let parsed = parse_envelope(RESPONSE).unwrap();
        assert_eq!(parsed.field("Status"), Some("Active"));
        assert_eq!(parsed.field("RemainingDeductible"), Some("900"));
        assert_eq!(parsed.field("TerminationDate"), None);
    }

    #[test]
    fn test_missing_response_node_is_malformed() {
        let xml = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body/></soap:Envelope>"#;
        assert!(matches!(parse_envelope(xml), Err(EligibilityError::MalformedResponse(_))));
        assert!(matches!(parse_envelope("not xml"), Err(EligibilityError::MalformedResponse(_))));
    }

    #[test]
    fn test_fault_is_malformed() {
        let xml = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body>
<soap:Fault><faultcode>soap:Server</faultcode><faultstring>Payer offline</faultstring></soap:Fault>
</soap:Body></soap:Envelope>"#;
        match parse_envelope(xml) {
            Err(EligibilityError::MalformedResponse(msg)) => assert!(msg.contains("Payer offline")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_adapter_posts_envelope_with_action() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/rtx/eligibility")
            .match_header("soapaction", "http://availity.com/rtx/RealTimeTransaction")
            .match_body(Matcher::Regex("<wsse:Username>svc</wsse:Username>".into()))
            .with_status(200)
            .with_header("content-type", "text/xml")
            .with_body(RESPONSE)
            .create_async()
            .await;

        let store = StaticCredentialStore::new()
            .with("availity", SecretKind::Username, "svc")
            .with("availity", SecretKind::Password, "pw");
        let broker = CredentialBroker::new(Client::new(), Arc::new(store), chrono::Duration::seconds(60));
        let adapter = SoapAdapter::new(Client::new(), Arc::new(broker));
        let mut provider = ProviderProfile::new(
            "availity",
            "Availity",
            ProtocolVariant::Soap,
            AuthScheme::Basic,
            server.url(),
        );
        provider.soap_action = Some("http://availity.com/rtx/RealTimeTransaction".into());

        let raw = adapter.query_eligibility(&provider, &query()).await.unwrap();
        match raw {
            RawProviderResponse::Soap(soap) => assert_eq!(soap.field("CoveragePercent"), Some("100")),
            other => panic!("unexpected {other:?}"),
        }
        mock.assert_async().await;
    }
}
