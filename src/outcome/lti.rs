use async_trait::async_trait;
use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::{header, Client, Url};
use uuid::Uuid;

use super::oauth::{self, Credentials};
use super::{OutcomeError, OutcomeReporter, OutcomeTarget};

const POX_NS: &str = "http://www.imsglobal.org/services/ltiv1p1/xsd/imsoms_v1p0";

/// LTI 1.1 Basic Outcomes client: POSTs a signed `replaceResultRequest`.
#[derive(Clone)]
pub struct LtiOutcomeReporter {
    http: Client,
}

impl LtiOutcomeReporter {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

pub fn replace_result_xml(message_id: &str, sourcedid: &str, score: f64) -> String {
    let score = if score.is_finite() { score.clamp(0.0, 1.0) } else { 0.0 };
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<imsx_POXEnvelopeRequest xmlns="{POX_NS}">
  <imsx_POXHeader>
    <imsx_POXRequestHeaderInfo>
      <imsx_version>V1.0</imsx_version>
      <imsx_messageIdentifier>{message_id}</imsx_messageIdentifier>
    </imsx_POXRequestHeaderInfo>
  </imsx_POXHeader>
  <imsx_POXBody>
    <replaceResultRequest>
      <resultRecord>
        <sourcedGUID><sourcedId>{sourcedid}</sourcedId></sourcedGUID>
        <result>
          <resultScore>
            <language>en</language>
            <textString>{score}</textString>
          </resultScore>
        </result>
      </resultRecord>
    </replaceResultRequest>
  </imsx_POXBody>
</imsx_POXEnvelopeRequest>"#,
        message_id = escape(message_id),
        sourcedid = escape(sourcedid),
    )
}

#[derive(Debug, Default, PartialEq)]
pub struct PoxStatus {
    pub code_major: Option<String>,
    pub description: Option<String>,
}

/// Pulls `imsx_codeMajor` and `imsx_description` out of a POX response.
pub fn parse_pox_status(xml: &str) -> Result<PoxStatus, quick_xml::Error> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut buf = Vec::new();
    let mut current = String::new();
    let mut status = PoxStatus::default();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                current = name.rsplit(':').next().unwrap_or(&name).to_string();
            }
            Event::Text(t) => {
                let text = t.unescape()?.into_owned();
                match current.as_str() {
                    "imsx_codeMajor" if status.code_major.is_none() => {
                        status.code_major = Some(text)
                    }
                    "imsx_description" if status.description.is_none() => {
                        status.description = Some(text)
                    }
                    _ => {}
                }
            }
            Event::End(_) => current.clear(),
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(status)
}

#[async_trait]
impl OutcomeReporter for LtiOutcomeReporter {
    async fn report(&self, target: &OutcomeTarget, score: f64) -> Result<(), OutcomeError> {
        let url = Url::parse(&target.service_url)
            .map_err(|e| OutcomeError::Rejected(format!("bad outcome service url: {e}")))?;
        let body = replace_result_xml(&Uuid::new_v4().to_string(), &target.sourcedid, score);
        let auth = oauth::authorization_header(
            "POST",
            &url,
            body.as_bytes(),
            &Credentials {
                consumer_key: &target.consumer_key,
                consumer_secret: &target.consumer_secret,
            },
            &Uuid::new_v4().simple().to_string(),
            chrono::Utc::now().timestamp(),
        );

        let res = self
            .http
            .post(url)
            .header(header::CONTENT_TYPE, "application/xml")
            .header(header::AUTHORIZATION, auth)
            .body(body)
            .send()
            .await
            .map_err(|e| OutcomeError::Rejected(e.to_string()))?;
        let http_status = res.status();
        let text = res
            .text()
            .await
            .map_err(|e| OutcomeError::Rejected(e.to_string()))?;
        if !http_status.is_success() {
            return Err(OutcomeError::Rejected(format!("consumer answered HTTP {http_status}")));
        }

        let pox = parse_pox_status(&text)
            .map_err(|e| OutcomeError::Rejected(format!("unreadable consumer response: {e}")))?;
        match pox.code_major.as_deref() {
            Some("success") => Ok(()),
            other => Err(OutcomeError::Rejected(
                pox.description
                    .unwrap_or_else(|| format!("codeMajor {}", other.unwrap_or("missing"))),
            )),
        }
    }
}
