//! Structural projection of inbound documents.
//!
//! Everything here maps a schema violation to `SamlError::Schema`. Nothing
//! here decides whether content is trustworthy; signatures are checked by the
//! caller on the same elements these projections were read from.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::{
    error::{SamlError, SamlResult},
    models::message::{
        Assertion, Attribute, AuthnStatement, Conditions, LogoutRequest, LogoutResponse, NameId,
        SamlResponse, Status, SubjectConfirmation, SubjectConfirmationData, parse_instant,
    },
    xml::{Element, NS_SAML, NS_SAMLP},
};

fn schema(message: impl Into<String>) -> SamlError {
    SamlError::Schema(message.into())
}

fn required_attr<'a>(element: &'a Element, name: &str) -> SamlResult<&'a str> {
    element
        .attr(name)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| schema(format!("{} is missing {name}", element.name)))
}

fn optional_instant(element: &Element, name: &str) -> SamlResult<Option<DateTime<Utc>>> {
    element
        .attr(name)
        .map(|v| {
            parse_instant(v).ok_or_else(|| schema(format!("{}/@{name} is not a dateTime", element.name)))
        })
        .transpose()
}

fn required_instant(element: &Element, name: &str) -> SamlResult<DateTime<Utc>> {
    optional_instant(element, name)?
        .ok_or_else(|| schema(format!("{} is missing {name}", element.name)))
}

fn check_version(element: &Element) -> SamlResult<()> {
    match element.attr("Version") {
        Some("2.0") => Ok(()),
        Some(other) => Err(schema(format!("unsupported SAML version {other}"))),
        None => Err(schema(format!("{} is missing Version", element.name))),
    }
}

fn issuer(element: &Element) -> Option<String> {
    element
        .child(NS_SAML, "Issuer")
        .map(|i| i.trimmed_text())
        .filter(|i| !i.is_empty())
}

/// Reject documents in which two elements share an `ID`.
///
/// A signature reference is resolved by `ID`, so duplicates would let a
/// signed element stand in for a different one.
pub fn check_unique_ids(root: &Element) -> SamlResult<()> {
    let mut seen = HashSet::new();
    let mut duplicate = None;
    root.walk(&mut |e| {
        if let Some(id) = e.attr("ID")
            && !seen.insert(id)
        {
            duplicate.get_or_insert_with(|| id.to_string());
        }
    });
    match duplicate {
        Some(id) => Err(schema(format!("duplicate ID {id}"))),
        None => Ok(()),
    }
}

pub fn parse_status(parent: &Element) -> SamlResult<Status> {
    let status = parent
        .child(NS_SAMLP, "Status")
        .ok_or_else(|| schema("missing Status"))?;
    let code = status
        .child(NS_SAMLP, "StatusCode")
        .ok_or_else(|| schema("missing StatusCode"))?;
    Ok(Status {
        code: required_attr(code, "Value")?.to_string(),
        sub_code: code
            .child(NS_SAMLP, "StatusCode")
            .and_then(|sub| sub.attr("Value"))
            .map(str::to_string),
        message: status
            .child(NS_SAMLP, "StatusMessage")
            .map(|m| m.trimmed_text()),
    })
}

fn parse_name_id(element: &Element) -> SamlResult<NameId> {
    let value = element.trimmed_text();
    if value.is_empty() {
        return Err(schema("empty NameID"));
    }
    Ok(NameId {
        value,
        format: element.attr("Format").map(str::to_string),
        name_qualifier: element.attr("NameQualifier").map(str::to_string),
        sp_name_qualifier: element.attr("SPNameQualifier").map(str::to_string),
    })
}

fn subject_name_id(parent: &Element) -> SamlResult<NameId> {
    if parent.child(NS_SAML, "EncryptedID").is_some() {
        return Err(schema("encrypted NameID is not supported"));
    }
    parse_name_id(
        parent
            .child(NS_SAML, "NameID")
            .ok_or_else(|| schema("missing NameID"))?,
    )
}

fn parse_confirmation(element: &Element) -> SamlResult<SubjectConfirmation> {
    let data = element
        .child(NS_SAML, "SubjectConfirmationData")
        .map(|d| {
            Ok::<_, SamlError>(SubjectConfirmationData {
                not_before: optional_instant(d, "NotBefore")?,
                not_on_or_after: optional_instant(d, "NotOnOrAfter")?,
                recipient: d.attr("Recipient").map(str::to_string),
                in_response_to: d.attr("InResponseTo").map(str::to_string),
            })
        })
        .transpose()?;
    Ok(SubjectConfirmation {
        method: required_attr(element, "Method")?.to_string(),
        data,
    })
}

fn parse_conditions(element: &Element) -> SamlResult<Conditions> {
    let audience_restrictions = element
        .children_named(NS_SAML, "AudienceRestriction")
        .map(|restriction| {
            restriction
                .children_named(NS_SAML, "Audience")
                .map(|a| a.trimmed_text())
                .collect()
        })
        .collect();
    Ok(Conditions {
        not_before: optional_instant(element, "NotBefore")?,
        not_on_or_after: optional_instant(element, "NotOnOrAfter")?,
        audience_restrictions,
    })
}

fn parse_attributes(assertion: &Element) -> Vec<Attribute> {
    assertion
        .children_named(NS_SAML, "AttributeStatement")
        .flat_map(|statement| statement.children_named(NS_SAML, "Attribute"))
        .filter_map(|attribute| {
            let name = attribute.attr("Name").filter(|n| !n.is_empty())?;
            Some(Attribute {
                name: name.to_string(),
                friendly_name: attribute.attr("FriendlyName").map(str::to_string),
                values: attribute
                    .children_named(NS_SAML, "AttributeValue")
                    .map(|v| v.trimmed_text())
                    .collect(),
            })
        })
        .collect()
}

pub fn parse_assertion(element: &Element) -> SamlResult<Assertion> {
    check_version(element)?;
    let subject = element
        .child(NS_SAML, "Subject")
        .ok_or_else(|| schema("assertion has no Subject"))?;

    let authn_statements = element
        .children_named(NS_SAML, "AuthnStatement")
        .map(|statement| {
            Ok(AuthnStatement {
                authn_instant: required_instant(statement, "AuthnInstant")?,
                session_index: statement.attr("SessionIndex").map(str::to_string),
                session_not_on_or_after: optional_instant(statement, "SessionNotOnOrAfter")?,
            })
        })
        .collect::<SamlResult<Vec<_>>>()?;

    Ok(Assertion {
        id: required_attr(element, "ID")?.to_string(),
        issuer: issuer(element).ok_or_else(|| schema("assertion has no Issuer"))?,
        issue_instant: required_instant(element, "IssueInstant")?,
        name_id: subject_name_id(subject)?,
        confirmations: subject
            .children_named(NS_SAML, "SubjectConfirmation")
            .map(parse_confirmation)
            .collect::<SamlResult<Vec<_>>>()?,
        conditions: element
            .child(NS_SAML, "Conditions")
            .map(parse_conditions)
            .transpose()?,
        authn_statements,
        attributes: parse_attributes(element),
        signed: false,
    })
}

/// Project a `samlp:Response`. Only assertions that are direct children of
/// the response are considered.
pub fn parse_response(root: &Element) -> SamlResult<SamlResponse> {
    if !root.is(NS_SAMLP, "Response") {
        return Err(schema(format!("expected Response, found {}", root.name)));
    }
    check_version(root)?;
    if root.child(NS_SAML, "EncryptedAssertion").is_some() {
        return Err(schema("encrypted assertions are not supported"));
    }

    Ok(SamlResponse {
        id: required_attr(root, "ID")?.to_string(),
        in_response_to: root.attr("InResponseTo").map(str::to_string),
        issuer: issuer(root),
        destination: root.attr("Destination").map(str::to_string),
        issue_instant: required_instant(root, "IssueInstant")?,
        status: parse_status(root)?,
        assertions: root
            .children_named(NS_SAML, "Assertion")
            .map(parse_assertion)
            .collect::<SamlResult<Vec<_>>>()?,
        signed: false,
    })
}

pub fn parse_logout_request(root: &Element) -> SamlResult<LogoutRequest> {
    if !root.is(NS_SAMLP, "LogoutRequest") {
        return Err(schema(format!("expected LogoutRequest, found {}", root.name)));
    }
    check_version(root)?;
    Ok(LogoutRequest {
        id: required_attr(root, "ID")?.to_string(),
        issuer: issuer(root).ok_or_else(|| schema("LogoutRequest has no Issuer"))?,
        destination: root.attr("Destination").map(str::to_string),
        issue_instant: required_instant(root, "IssueInstant")?,
        not_on_or_after: optional_instant(root, "NotOnOrAfter")?,
        name_id: subject_name_id(root)?,
        session_indexes: root
            .children_named(NS_SAMLP, "SessionIndex")
            .map(|s| s.trimmed_text())
            .filter(|s| !s.is_empty())
            .collect(),
    })
}

pub fn parse_logout_response(root: &Element) -> SamlResult<LogoutResponse> {
    if !root.is(NS_SAMLP, "LogoutResponse") {
        return Err(schema(format!("expected LogoutResponse, found {}", root.name)));
    }
    check_version(root)?;
    Ok(LogoutResponse {
        id: required_attr(root, "ID")?.to_string(),
        in_response_to: root.attr("InResponseTo").map(str::to_string),
        issuer: issuer(root).ok_or_else(|| schema("LogoutResponse has no Issuer"))?,
        destination: root.attr("Destination").map(str::to_string),
        issue_instant: required_instant(root, "IssueInstant")?,
        status: parse_status(root)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::dom;

    const RESPONSE: &str = r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_r1" Version="2.0" IssueInstant="2024-05-01T12:00:00Z" InResponseTo="_req1" Destination="https://sp.example.com/acs">
  <saml:Issuer>https://idp.acme.com/saml</saml:Issuer>
  <samlp:Status><samlp:StatusCode Value="urn:oasis:names:tc:SAML:2.0:status:Success"/></samlp:Status>
  <saml:Assertion ID="_a1" Version="2.0" IssueInstant="2024-05-01T12:00:00Z">
    <saml:Issuer>https://idp.acme.com/saml</saml:Issuer>
    <saml:Subject>
      <saml:NameID Format="urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress">alice@acme.com</saml:NameID>
      <saml:SubjectConfirmation Method="urn:oasis:names:tc:SAML:2.0:cm:bearer">
        <saml:SubjectConfirmationData NotOnOrAfter="2024-05-01T12:05:00Z" Recipient="https://sp.example.com/acs" InResponseTo="_req1"/>
      </saml:SubjectConfirmation>
    </saml:Subject>
    <saml:Conditions NotBefore="2024-05-01T11:59:00Z" NotOnOrAfter="2024-05-01T12:05:00Z">
      <saml:AudienceRestriction><saml:Audience>https://sp.example.com</saml:Audience></saml:AudienceRestriction>
    </saml:Conditions>
    <saml:AuthnStatement AuthnInstant="2024-05-01T12:00:00Z" SessionIndex="_s1"/>
    <saml:AttributeStatement>
      <saml:Attribute Name="groups" FriendlyName="Groups">
        <saml:AttributeValue>admins</saml:AttributeValue>
        <saml:AttributeValue>staff</saml:AttributeValue>
      </saml:Attribute>
    </saml:AttributeStatement>
  </saml:Assertion>
</samlp:Response>"#;

    #[test]
    fn test_parse_response() {
        let root = dom::parse(RESPONSE).unwrap();
        check_unique_ids(&root).unwrap();
        let response = parse_response(&root).unwrap();
        assert_eq!(response.id, "_r1");
        assert_eq!(response.in_response_to.as_deref(), Some("_req1"));
        assert!(response.status.is_success());

        let assertion = &response.assertions[0];
        assert_eq!(assertion.name_id.value, "alice@acme.com");
        assert_eq!(assertion.bearer_confirmations().count(), 1);
        let conditions = assertion.conditions.as_ref().unwrap();
        assert_eq!(
            conditions.audience_restrictions,
            vec![vec!["https://sp.example.com".to_string()]]
        );
        assert_eq!(assertion.authn_statements[0].session_index.as_deref(), Some("_s1"));
        assert_eq!(assertion.attributes[0].values, vec!["admins", "staff"]);
        assert!(!assertion.signed);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let xml = RESPONSE.replace(r#"ID="_a1""#, r#"ID="_r1""#);
        let root = dom::parse(&xml).unwrap();
        assert!(matches!(check_unique_ids(&root), Err(SamlError::Schema(_))));
    }

    #[test]
    fn test_encrypted_assertion_rejected() {
        let xml = RESPONSE.replace(
            "<saml:Assertion ID=\"_a1\"",
            "<saml:EncryptedAssertion/><saml:Assertion ID=\"_a1\"",
        );
        let root = dom::parse(&xml).unwrap();
        assert!(matches!(parse_response(&root), Err(SamlError::Schema(_))));
    }

    #[rstest::rstest]
    #[case::wrong_version(
        r#"Version="2.0" IssueInstant="2024-05-01T12:00:00Z" InResponseTo"#,
        r#"Version="1.1" IssueInstant="2024-05-01T12:00:00Z" InResponseTo"#
    )]
    #[case::empty_name_id(">alice@acme.com<", "><")]
    #[case::bad_instant(r#"AuthnInstant="2024-05-01T12:00:00Z""#, r#"AuthnInstant="yesterday""#)]
    #[case::missing_status(
        r#"<samlp:Status><samlp:StatusCode Value="urn:oasis:names:tc:SAML:2.0:status:Success"/></samlp:Status>"#,
        ""
    )]
    #[case::missing_method(r#" Method="urn:oasis:names:tc:SAML:2.0:cm:bearer""#, "")]
    fn test_schema_violations(#[case] from: &str, #[case] to: &str) {
        let xml = RESPONSE.replace(from, to);
        let root = dom::parse(&xml).unwrap();
        assert!(matches!(parse_response(&root), Err(SamlError::Schema(_))));
    }

    #[test]
    fn test_nested_assertions_ignored() {
        let xml = RESPONSE.replace(
            "<samlp:Status>",
            r#"<samlp:Extensions><saml:Assertion ID="_hidden"/></samlp:Extensions><samlp:Status>"#,
        );
        let root = dom::parse(&xml).unwrap();
        let response = parse_response(&root).unwrap();
        assert_eq!(response.assertions.len(), 1);
        assert_eq!(response.assertions[0].id, "_a1");
    }

    #[test]
    fn test_parse_logout_request() {
        let xml = r#"<samlp:LogoutRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_l1" Version="2.0" IssueInstant="2024-05-01T12:00:00Z"><saml:Issuer>https://idp.acme.com/saml</saml:Issuer><saml:NameID>alice@acme.com</saml:NameID><samlp:SessionIndex>_s1</samlp:SessionIndex><samlp:SessionIndex>_s2</samlp:SessionIndex></samlp:LogoutRequest>"#;
        let request = parse_logout_request(&dom::parse(xml).unwrap()).unwrap();
        assert_eq!(request.name_id.value, "alice@acme.com");
        assert_eq!(request.session_indexes, vec!["_s1", "_s2"]);
        assert!(request.not_on_or_after.is_none());
    }

    #[test]
    fn test_parse_logout_response_status() {
        let xml = r#"<samlp:LogoutResponse xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_lr1" Version="2.0" IssueInstant="2024-05-01T12:00:00Z" InResponseTo="_l1"><saml:Issuer>https://idp.acme.com/saml</saml:Issuer><samlp:Status><samlp:StatusCode Value="urn:oasis:names:tc:SAML:2.0:status:Responder"><samlp:StatusCode Value="urn:oasis:names:tc:SAML:2.0:status:PartialLogout"/></samlp:StatusCode></samlp:Status></samlp:LogoutResponse>"#;
        let response = parse_logout_response(&dom::parse(xml).unwrap()).unwrap();
        assert!(!response.status.is_success());
        assert_eq!(
            response.status.sub_code.as_deref(),
            Some(crate::models::message::STATUS_PARTIAL_LOGOUT)
        );
    }
}
