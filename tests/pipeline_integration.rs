//! Pipeline integration tests
//!
//! End-to-end tests exercising the full upload → review → anonymize →
//! toggle lifecycle against the in-memory stores. Covers triage, audit
//! records, spreadsheets, cancellation, failure reverts, key rotation across
//! pipeline instances, partner and session isolation, and concurrency.

use a3s_anonymize::{
    AnonymizeError, Anonymizer, AnonymizerConfig, DetectionSettings, EntityCandidate,
    EntityCategory, FileContent, FileState, FileType, IgnoreOrigin, MemoryFileStore,
    MemoryPartnerStore, NewPartner, PartnerSecrets, PartnerSettingsUpdate, PatternDetector,
    PiiDetector, StaticDetector,
};
use async_trait::async_trait;
use std::io::Write;
use std::time::Duration;

const ACME_TEXT: &str = "Zain Ahmad paid with 4111 1111 1111 1111, call 0112578107";

fn acme_candidates() -> Vec<EntityCandidate> {
    vec![
        EntityCandidate::text(EntityCategory::Person, "Zain Ahmad", 0, 10, 92.0).with_id("c-person"),
        EntityCandidate::text(EntityCategory::CreditCard, "4111 1111 1111 1111", 21, 40, 80.0)
            .with_id("c-card"),
        EntityCandidate::text(EntityCategory::PhoneNumber, "0112578107", 47, 57, 55.0)
            .with_id("c-phone"),
    ]
}

fn with_detector(detector: impl PiiDetector + 'static) -> Anonymizer {
    Anonymizer::new(MemoryPartnerStore::new(), MemoryFileStore::new(), detector)
}

async fn register(anonymizer: &Anonymizer, name: &str) -> String {
    anonymizer
        .register_partner(NewPartner::new(name, format!("{}-key", name), "file-pw"))
        .await
        .unwrap()
        .id
}

const CONTENT_TYPES: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/><Override PartName="/xl/worksheets/sheet1.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/></Types>"#;

const ROOT_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/></Relationships>"#;

const WORKBOOK: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets><sheet name="Customers" sheetId="1" r:id="rId1"/></sheets></workbook>"#;

const WORKBOOK_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/></Relationships>"#;

/// Minimal single-sheet xlsx with inline string cells
fn workbook(rows: &[&[&str]]) -> Vec<u8> {
    let mut sheet = String::from(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>"#,
    );
    for (r, row) in rows.iter().enumerate() {
        sheet.push_str(&format!(r#"<row r="{}">"#, r + 1));
        for (c, value) in row.iter().enumerate() {
            let cell = format!("{}{}", (b'A' + c as u8) as char, r + 1);
            sheet.push_str(&format!(
                r#"<c r="{}" t="inlineStr"><is><t>{}</t></is></c>"#,
                cell, value
            ));
        }
        sheet.push_str("</row>");
    }
    sheet.push_str("</sheetData></worksheet>");

    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, body) in [
        ("[Content_Types].xml", CONTENT_TYPES),
        ("_rels/.rels", ROOT_RELS),
        ("xl/workbook.xml", WORKBOOK),
        ("xl/_rels/workbook.xml.rels", WORKBOOK_RELS),
        ("xl/worksheets/sheet1.xml", sheet.as_str()),
    ] {
        zip.start_file(name, zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(body.as_bytes()).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

fn rotate_to(key: &str) -> PartnerSettingsUpdate {
    PartnerSettingsUpdate {
        secrets: Some(PartnerSecrets::new(key, "rotated-pw")),
        ..Default::default()
    }
}

struct FailingDetector;

#[async_trait]
impl PiiDetector for FailingDetector {
    async fn detect(
        &self,
        _content: &FileContent,
        _file_type: FileType,
        _enabled: &[EntityCategory],
    ) -> a3s_anonymize::Result<Vec<EntityCandidate>> {
        Err(AnonymizeError::DetectionUnavailable(
            "classifier offline".to_string(),
        ))
    }

    fn name(&self) -> &str {
        "failing"
    }
}

struct SlowDetector;

#[async_trait]
impl PiiDetector for SlowDetector {
    async fn detect(
        &self,
        _content: &FileContent,
        _file_type: FileType,
        _enabled: &[EntityCategory],
    ) -> a3s_anonymize::Result<Vec<EntityCandidate>> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Vec::new())
    }

    fn name(&self) -> &str {
        "slow"
    }
}

// ─── Triage & Audit ──────────────────────────────────────────────

#[tokio::test]
async fn test_acme_scenario() {
    let anonymizer = with_detector(StaticDetector::new(acme_candidates()));
    let partner = anonymizer
        .register_partner(
            NewPartner::new("Acme", "acme-key", "acme-pw").with_detection_settings(
                DetectionSettings::default().with(EntityCategory::CreditCard, false),
            ),
        )
        .await
        .unwrap();

    let view = anonymizer
        .upload(&partner.id, "notes.txt", ACME_TEXT.as_bytes())
        .await
        .unwrap();

    // Disabled category dropped, low-confidence phone auto-ignored
    assert_eq!(view.candidates.len(), 2);
    let person = view.candidates.iter().find(|c| c.id == "c-person").unwrap();
    assert!(!person.ignore);
    let phone = view.candidates.iter().find(|c| c.id == "c-phone").unwrap();
    assert!(phone.ignore);
    assert_eq!(phone.ignore_origin, IgnoreOrigin::Auto);
    assert!(view.candidates.iter().all(|c| c.entity != EntityCategory::CreditCard));

    let file = anonymizer.proceed(&partner.id, &view.id).await.unwrap();
    assert_eq!(file.state, FileState::Anonymized);
    assert!(file.has_audit_log);

    let audit = anonymizer.get_audit_log(&partner.id, &file.id).await.unwrap();
    assert_eq!(audit.intended_for, "Acme");
    assert_eq!(audit.filename, "notes.txt");
    assert_eq!(audit.file_type, FileType::Text);
    let json = serde_json::to_value(&audit).unwrap();
    assert_eq!(
        json["detectedEntitiesSummary"],
        serde_json::json!([{"entity": "PERSON", "count": 1}])
    );
    assert_eq!(json["anonymizedMethod"], "Encryption");

    // Only the person is sealed; card and phone stay in clear text
    let redacted = String::from_utf8(anonymizer.download(&partner.id, &file.id).await.unwrap())
        .unwrap();
    assert!(!redacted.contains("Zain Ahmad"));
    assert!(redacted.starts_with("[[enc:"));
    assert!(redacted.contains("4111 1111 1111 1111"));
    assert!(redacted.contains("0112578107"));
}

#[tokio::test]
async fn test_summary_counts_follow_reviewer_overrides() {
    let text = "Wong Chen and Hafiz Zawawi met Wong Chen at zain@example.com";
    let anonymizer = with_detector(StaticDetector::new(vec![
        EntityCandidate::text(EntityCategory::Person, "Wong Chen", 0, 9, 95.0).with_id("p1"),
        EntityCandidate::text(EntityCategory::Person, "Hafiz Zawawi", 14, 26, 90.0).with_id("p2"),
        EntityCandidate::text(EntityCategory::Person, "Wong Chen", 31, 40, 88.0).with_id("p3"),
        EntityCandidate::text(EntityCategory::Email, "zain@example.com", 44, 60, 60.0)
            .with_id("e1"),
    ]));
    let partner_id = register(&anonymizer, "Starbucks").await;
    let view = anonymizer
        .upload(&partner_id, "minutes.txt", text.as_bytes())
        .await
        .unwrap();

    // Reviewer keeps the low-confidence email and drops one person
    let email = anonymizer.toggle_ignore(&partner_id, &view.id, "e1").unwrap();
    assert!(!email.ignore);
    assert_eq!(email.ignore_origin, IgnoreOrigin::Human);
    anonymizer.toggle_ignore(&partner_id, &view.id, "p2").unwrap();

    let file = anonymizer.proceed(&partner_id, &view.id).await.unwrap();
    let audit = anonymizer.get_audit_log(&partner_id, &file.id).await.unwrap();
    assert_eq!(audit.count_for(EntityCategory::Person), 2);
    assert_eq!(audit.count_for(EntityCategory::Email), 1);
    let order: Vec<_> = audit.detected_entities_summary.iter().map(|e| e.entity).collect();
    assert_eq!(order, vec![EntityCategory::Person, EntityCategory::Email]);
}

#[tokio::test]
async fn test_unknown_candidate_toggle() {
    let anonymizer = with_detector(StaticDetector::new(acme_candidates()));
    let partner_id = register(&anonymizer, "Acme").await;
    let view = anonymizer
        .upload(&partner_id, "notes.txt", ACME_TEXT.as_bytes())
        .await
        .unwrap();

    let err = anonymizer.toggle_ignore(&partner_id, &view.id, "c-nope").unwrap_err();
    assert!(matches!(err, AnonymizeError::CandidateNotFound { .. }));
}

// ─── Lifecycle ───────────────────────────────────────────────────

#[tokio::test]
async fn test_toggle_roundtrip_is_byte_identical() {
    let anonymizer = with_detector(StaticDetector::new(acme_candidates()));
    let partner_id = register(&anonymizer, "Acme").await;
    let view = anonymizer
        .upload(&partner_id, "notes.txt", ACME_TEXT.as_bytes())
        .await
        .unwrap();
    let file = anonymizer.proceed(&partner_id, &view.id).await.unwrap();

    let sealed = anonymizer.download(&partner_id, &file.id).await.unwrap();
    let audit = anonymizer.get_audit_log(&partner_id, &file.id).await.unwrap();

    let toggled = anonymizer
        .toggle_anonymization(&partner_id, &file.id)
        .await
        .unwrap();
    assert_eq!(toggled.state, FileState::DeAnonymized);
    let original = anonymizer.download(&partner_id, &file.id).await.unwrap();
    assert_eq!(original, ACME_TEXT.as_bytes());

    let toggled = anonymizer
        .toggle_anonymization(&partner_id, &file.id)
        .await
        .unwrap();
    assert_eq!(toggled.state, FileState::Anonymized);
    assert_eq!(anonymizer.download(&partner_id, &file.id).await.unwrap(), sealed);
    assert_eq!(
        anonymizer.get_audit_log(&partner_id, &file.id).await.unwrap(),
        audit
    );
}

#[tokio::test]
async fn test_pending_file_rejects_toggle_and_audit() {
    let anonymizer = with_detector(StaticDetector::new(acme_candidates()));
    let partner_id = register(&anonymizer, "Acme").await;
    let view = anonymizer
        .upload(&partner_id, "notes.txt", ACME_TEXT.as_bytes())
        .await
        .unwrap();

    let err = anonymizer
        .toggle_anonymization(&partner_id, &view.file_id)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AnonymizeError::InvalidStateTransition {
            state: FileState::PendingReview,
            ..
        }
    ));

    let err = anonymizer
        .get_audit_log(&partner_id, &view.file_id)
        .await
        .unwrap_err();
    assert!(matches!(err, AnonymizeError::NoAuditLog(_)));

    let err = anonymizer.download(&partner_id, &view.file_id).await.unwrap_err();
    assert!(matches!(err, AnonymizeError::InvalidStateTransition { .. }));

    // Unchanged by the rejected calls
    let file = anonymizer.file(&partner_id, &view.file_id).await.unwrap();
    assert_eq!(file.state, FileState::PendingReview);
    assert_eq!(file.pending_candidates, Some(3));
}

#[tokio::test]
async fn test_tabular_column_roundtrip() {
    let csv = "Name,Identification Number\n\
               Wong Chen,820927-07-7473\n\
               Hafiz Zawawi,521210-08-9327\n";
    let anonymizer = with_detector(PatternDetector::new().unwrap());
    let partner_id = register(&anonymizer, "Acme").await;

    let view = anonymizer
        .upload(&partner_id, "Customers.csv", csv.as_bytes())
        .await
        .unwrap();
    assert_eq!(view.file_type, FileType::Tabular);
    assert_eq!(view.candidates.len(), 1);
    assert_eq!(view.candidates[0].entity, EntityCategory::IcNumber);

    let file = anonymizer.proceed(&partner_id, &view.id).await.unwrap();
    let sealed = anonymizer.download(&partner_id, &file.id).await.unwrap();
    let sealed = FileContent::decode(FileType::Tabular, &sealed).unwrap();
    let FileContent::Tabular { table } = sealed else {
        panic!("expected tabular content");
    };
    assert_eq!(table.rows[0][0], "Wong Chen");
    assert!(table.rows.iter().all(|row| row[1].starts_with("[[enc:")));

    anonymizer
        .toggle_anonymization(&partner_id, &file.id)
        .await
        .unwrap();
    let restored = anonymizer.download(&partner_id, &file.id).await.unwrap();
    assert_eq!(
        FileContent::decode(FileType::Tabular, &restored).unwrap(),
        FileContent::decode(FileType::Tabular, csv.as_bytes()).unwrap()
    );
}

#[tokio::test]
async fn test_spreadsheet_upload_roundtrip() {
    let xlsx = workbook(&[
        &["Name", "Identification Number"],
        &["Wong Chen", "820927-07-7473"],
        &["Hafiz Zawawi", "521210-08-9327"],
    ]);
    let anonymizer = with_detector(PatternDetector::new().unwrap());
    let partner_id = register(&anonymizer, "Starbucks").await;

    let view = anonymizer
        .upload(&partner_id, "Customers_Orders.xlsx", &xlsx)
        .await
        .unwrap();
    assert_eq!(view.file_type, FileType::Tabular);
    assert_eq!(view.candidates.len(), 1);
    assert_eq!(view.candidates[0].entity, EntityCategory::IcNumber);

    let file = anonymizer.proceed(&partner_id, &view.id).await.unwrap();
    let sealed = String::from_utf8(anonymizer.download(&partner_id, &file.id).await.unwrap())
        .unwrap();
    assert!(sealed.starts_with("Name,Identification Number\nWong Chen,[[enc:"));
    assert!(!sealed.contains("820927-07-7473"));

    // Restored spreadsheets download as CSV
    anonymizer
        .toggle_anonymization(&partner_id, &file.id)
        .await
        .unwrap();
    let restored = anonymizer.download(&partner_id, &file.id).await.unwrap();
    assert_eq!(
        String::from_utf8(restored).unwrap(),
        "Name,Identification Number\nWong Chen,820927-07-7473\nHafiz Zawawi,521210-08-9327\n"
    );
}

#[tokio::test]
async fn test_csv_with_blank_lines_accepted() {
    let csv = "Name,Identification Number\n\nWong Chen,820927-07-7473\n\n";
    let anonymizer = with_detector(PatternDetector::new().unwrap());
    let partner_id = register(&anonymizer, "Acme").await;

    let view = anonymizer
        .upload(&partner_id, "Customers.csv", csv.as_bytes())
        .await
        .unwrap();
    assert_eq!(view.candidates.len(), 1);
    let file = anonymizer.proceed(&partner_id, &view.id).await.unwrap();
    assert_eq!(file.state, FileState::Anonymized);
}

#[tokio::test]
async fn test_corrupt_spreadsheet_is_malformed() {
    let anonymizer = with_detector(PatternDetector::new().unwrap());
    let partner_id = register(&anonymizer, "Acme").await;
    let err = anonymizer
        .upload(&partner_id, "Customers_Orders.xlsx", b"PK\x03\x04truncated")
        .await
        .unwrap_err();
    assert!(matches!(err, AnonymizeError::MalformedInput(_)));
    assert!(anonymizer.list_files(&partner_id).await.unwrap().is_empty());
}

// ─── Cancel & Revert ─────────────────────────────────────────────

#[tokio::test]
async fn test_cancel_after_proceed_is_session_not_found() {
    let anonymizer = with_detector(StaticDetector::new(acme_candidates()));
    let partner_id = register(&anonymizer, "Acme").await;
    let view = anonymizer
        .upload(&partner_id, "notes.txt", ACME_TEXT.as_bytes())
        .await
        .unwrap();
    let file = anonymizer.proceed(&partner_id, &view.id).await.unwrap();

    let err = anonymizer.cancel(&partner_id, &view.id).await.unwrap_err();
    assert!(matches!(err, AnonymizeError::SessionNotFound(_)));

    // Still anonymized with its audit log
    let after = anonymizer.file(&partner_id, &file.id).await.unwrap();
    assert_eq!(after.state, FileState::Anonymized);
    assert!(after.has_audit_log);
}

#[tokio::test]
async fn test_cancel_new_upload_discards_file() {
    let anonymizer = with_detector(StaticDetector::new(acme_candidates()));
    let partner_id = register(&anonymizer, "Acme").await;
    let view = anonymizer
        .upload(&partner_id, "notes.txt", ACME_TEXT.as_bytes())
        .await
        .unwrap();

    assert!(anonymizer.cancel(&partner_id, &view.id).await.unwrap().is_none());
    assert!(anonymizer.list_files(&partner_id).await.unwrap().is_empty());
    assert!(matches!(
        anonymizer.session(&partner_id, &view.id).unwrap_err(),
        AnonymizeError::SessionNotFound(_)
    ));
}

#[tokio::test]
async fn test_cancel_reupload_restores_prior_file() {
    let anonymizer = with_detector(StaticDetector::new(acme_candidates()));
    let partner_id = register(&anonymizer, "Acme").await;
    let view = anonymizer
        .upload(&partner_id, "notes.txt", ACME_TEXT.as_bytes())
        .await
        .unwrap();
    let file = anonymizer.proceed(&partner_id, &view.id).await.unwrap();
    let sealed = anonymizer.download(&partner_id, &file.id).await.unwrap();

    let review = anonymizer
        .reupload(&partner_id, &file.id, ACME_TEXT.as_bytes())
        .await
        .unwrap();
    assert_eq!(review.file_id, file.id);
    let pending = anonymizer.file(&partner_id, &file.id).await.unwrap();
    assert_eq!(pending.state, FileState::PendingReview);
    // The last audit log survives until the next commit
    assert!(pending.has_audit_log);

    let restored = anonymizer.cancel(&partner_id, &review.id).await.unwrap().unwrap();
    assert_eq!(restored.state, FileState::Anonymized);
    assert_eq!(anonymizer.download(&partner_id, &file.id).await.unwrap(), sealed);
}

#[tokio::test]
async fn test_executor_failure_reverts_reupload() {
    let anonymizer = with_detector(StaticDetector::new(vec![EntityCandidate::text(
        EntityCategory::Person,
        "Zain",
        0,
        4,
        95.0,
    )]));
    let partner_id = register(&anonymizer, "Acme").await;
    let view = anonymizer
        .upload(&partner_id, "notes.txt", b"Zain called")
        .await
        .unwrap();
    let file = anonymizer.proceed(&partner_id, &view.id).await.unwrap();
    let sealed = anonymizer.download(&partner_id, &file.id).await.unwrap();
    let audit = anonymizer.get_audit_log(&partner_id, &file.id).await.unwrap();

    // New content no longer matches the detected span
    let review = anonymizer
        .reupload(&partner_id, &file.id, b"Ali called")
        .await
        .unwrap();
    let err = anonymizer.proceed(&partner_id, &review.id).await.unwrap_err();
    assert!(matches!(err, AnonymizeError::MalformedInput(_)));

    let after = anonymizer.file(&partner_id, &file.id).await.unwrap();
    assert_eq!(after.state, FileState::Anonymized);
    assert_eq!(anonymizer.download(&partner_id, &file.id).await.unwrap(), sealed);
    assert_eq!(
        anonymizer.get_audit_log(&partner_id, &file.id).await.unwrap(),
        audit
    );
    assert!(matches!(
        anonymizer.session(&partner_id, &review.id).unwrap_err(),
        AnonymizeError::SessionNotFound(_)
    ));
}

#[tokio::test]
async fn test_missing_key_leaves_no_audit() {
    let anonymizer = with_detector(StaticDetector::new(acme_candidates()));
    let partner = anonymizer
        .register_partner(NewPartner::new("Keyless", "", "pw"))
        .await
        .unwrap();
    let view = anonymizer
        .upload(&partner.id, "notes.txt", ACME_TEXT.as_bytes())
        .await
        .unwrap();

    let err = anonymizer.proceed(&partner.id, &view.id).await.unwrap_err();
    assert!(matches!(err, AnonymizeError::KeyUnavailable(_)));

    // No half-committed file and no dangling review
    assert!(anonymizer.list_files(&partner.id).await.unwrap().is_empty());
    assert!(matches!(
        anonymizer.get_audit_log(&partner.id, &view.file_id).await.unwrap_err(),
        AnonymizeError::FileNotFound(_)
    ));
}

// ─── Collaborators ───────────────────────────────────────────────

#[tokio::test]
async fn test_detection_unavailable_surfaces() {
    let anonymizer = with_detector(FailingDetector);
    let partner_id = register(&anonymizer, "Acme").await;

    let err = anonymizer
        .upload(&partner_id, "notes.txt", ACME_TEXT.as_bytes())
        .await
        .unwrap_err();
    assert!(matches!(err, AnonymizeError::DetectionUnavailable(_)));
    assert!(anonymizer.list_files(&partner_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_detection_timeout() {
    let anonymizer = Anonymizer::with_config(
        MemoryPartnerStore::new(),
        MemoryFileStore::new(),
        SlowDetector,
        AnonymizerConfig {
            detection_timeout_secs: Some(1),
            ..Default::default()
        },
    )
    .unwrap();
    let partner_id = register(&anonymizer, "Acme").await;

    let err = anonymizer
        .upload(&partner_id, "notes.txt", b"text")
        .await
        .unwrap_err();
    assert!(matches!(err, AnonymizeError::DetectionUnavailable(_)));
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let result = Anonymizer::with_config(
        MemoryPartnerStore::new(),
        MemoryFileStore::new(),
        StaticDetector::new(vec![]),
        AnonymizerConfig {
            auto_ignore_threshold: 150.0,
            ..Default::default()
        },
    );
    assert!(matches!(result, Err(AnonymizeError::Config(_))));
}

#[tokio::test]
async fn test_non_utf8_text_is_malformed() {
    let anonymizer = with_detector(StaticDetector::new(vec![]));
    let partner_id = register(&anonymizer, "Acme").await;
    let err = anonymizer
        .upload(&partner_id, "notes.txt", &[0xff, 0xfe, 0x00])
        .await
        .unwrap_err();
    assert!(matches!(err, AnonymizeError::MalformedInput(_)));
}

// ─── Partners ────────────────────────────────────────────────────

#[tokio::test]
async fn test_partner_profile_hides_secrets() {
    let anonymizer = with_detector(StaticDetector::new(vec![]));
    let partner = anonymizer
        .register_partner(NewPartner::new("Acme", "super-secret-key", "super-secret-pw"))
        .await
        .unwrap();

    assert_eq!(partner.logo, "/icons/default_partner.svg");
    let json = serde_json::to_string(&partner).unwrap();
    assert!(!json.contains("super-secret"));
    assert_eq!(anonymizer.get_partner(&partner.id).await.unwrap(), partner);
    assert_eq!(anonymizer.list_partners().await.unwrap().len(), 1);

    let err = anonymizer.get_partner("missing").await.unwrap_err();
    assert!(matches!(err, AnonymizeError::PartnerNotFound(_)));
}

#[tokio::test]
async fn test_detection_settings_apply_to_next_upload() {
    let anonymizer = with_detector(PatternDetector::new().unwrap());
    let partner_id = register(&anonymizer, "Acme").await;
    let text = b"Mail zain@example.com or call +6011-2578107";

    let first = anonymizer.upload(&partner_id, "a.txt", text).await.unwrap();
    assert_eq!(first.candidates.len(), 2);

    anonymizer
        .update_partner_settings(
            &partner_id,
            PartnerSettingsUpdate {
                detection_settings: Some(
                    DetectionSettings::default().with(EntityCategory::Email, false),
                ),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // The open session keeps its candidates
    assert_eq!(anonymizer.session(&partner_id, &first.id).unwrap().candidates.len(), 2);

    let second = anonymizer.upload(&partner_id, "b.txt", text).await.unwrap();
    assert_eq!(second.candidates.len(), 1);
    assert_eq!(second.candidates[0].entity, EntityCategory::PhoneNumber);
}

#[tokio::test]
async fn test_key_rotation_keeps_old_files_readable() {
    let anonymizer = with_detector(StaticDetector::new(acme_candidates()));
    let partner_id = register(&anonymizer, "Acme").await;
    let view = anonymizer
        .upload(&partner_id, "old.txt", ACME_TEXT.as_bytes())
        .await
        .unwrap();
    let old = anonymizer.proceed(&partner_id, &view.id).await.unwrap();
    let old_sealed = anonymizer.download(&partner_id, &old.id).await.unwrap();

    anonymizer
        .update_partner_settings(
            &partner_id,
            PartnerSettingsUpdate {
                secrets: Some(PartnerSecrets::new("rotated-key", "rotated-pw")),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let view = anonymizer
        .upload(&partner_id, "new.txt", ACME_TEXT.as_bytes())
        .await
        .unwrap();
    let new = anonymizer.proceed(&partner_id, &view.id).await.unwrap();
    let new_sealed = anonymizer.download(&partner_id, &new.id).await.unwrap();
    assert_ne!(old_sealed, new_sealed);

    for file_id in [&old.id, &new.id] {
        anonymizer
            .toggle_anonymization(&partner_id, file_id)
            .await
            .unwrap();
        assert_eq!(
            anonymizer.download(&partner_id, file_id).await.unwrap(),
            ACME_TEXT.as_bytes()
        );
    }
}

#[tokio::test]
async fn test_rotation_to_empty_key_rejected() {
    let anonymizer = with_detector(StaticDetector::new(vec![]));
    let partner_id = register(&anonymizer, "Acme").await;
    let err = anonymizer
        .update_partner_settings(
            &partner_id,
            PartnerSettingsUpdate {
                secrets: Some(PartnerSecrets::new("", "pw")),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AnonymizeError::InvalidPartner(_)));
}

#[tokio::test]
async fn test_rotated_files_open_from_another_instance() {
    let partners = MemoryPartnerStore::new();
    let files = MemoryFileStore::new();
    let first = Anonymizer::new(
        partners.clone(),
        files.clone(),
        StaticDetector::new(acme_candidates()),
    );
    let partner_id = register(&first, "Acme").await;
    let view = first
        .upload(&partner_id, "notes.txt", ACME_TEXT.as_bytes())
        .await
        .unwrap();
    let file = first.proceed(&partner_id, &view.id).await.unwrap();
    let sealed = first.download(&partner_id, &file.id).await.unwrap();

    first
        .update_partner_settings(&partner_id, rotate_to("rotated-key"))
        .await
        .unwrap();
    assert_eq!(first.download(&partner_id, &file.id).await.unwrap(), sealed);

    // A fresh pipeline over the same stores, as after a restart
    let second = Anonymizer::new(partners, files, StaticDetector::new(vec![]));
    let toggled = second
        .toggle_anonymization(&partner_id, &file.id)
        .await
        .unwrap();
    assert_eq!(toggled.state, FileState::DeAnonymized);
    assert_eq!(
        second.download(&partner_id, &file.id).await.unwrap(),
        ACME_TEXT.as_bytes()
    );
}

#[tokio::test]
async fn test_rotation_refused_while_review_open() {
    let anonymizer = with_detector(StaticDetector::new(acme_candidates()));
    let partner_id = register(&anonymizer, "Acme").await;
    let view = anonymizer
        .upload(&partner_id, "notes.txt", ACME_TEXT.as_bytes())
        .await
        .unwrap();
    let file = anonymizer.proceed(&partner_id, &view.id).await.unwrap();
    let review = anonymizer
        .reupload(&partner_id, &file.id, ACME_TEXT.as_bytes())
        .await
        .unwrap();

    let err = anonymizer
        .update_partner_settings(&partner_id, rotate_to("rotated-key"))
        .await
        .unwrap_err();
    assert!(matches!(err, AnonymizeError::FileBusy(id) if id == file.id));

    // Nothing changed: the restored snapshot still opens, then rotation goes through
    anonymizer.cancel(&partner_id, &review.id).await.unwrap();
    anonymizer
        .update_partner_settings(&partner_id, rotate_to("rotated-key"))
        .await
        .unwrap();
    anonymizer
        .toggle_anonymization(&partner_id, &file.id)
        .await
        .unwrap();
    assert_eq!(
        anonymizer.download(&partner_id, &file.id).await.unwrap(),
        ACME_TEXT.as_bytes()
    );
}

#[tokio::test]
async fn test_partner_isolation() {
    let anonymizer = with_detector(StaticDetector::new(acme_candidates()));
    let acme = register(&anonymizer, "Acme").await;
    let globex = register(&anonymizer, "Globex").await;
    let view = anonymizer
        .upload(&acme, "notes.txt", ACME_TEXT.as_bytes())
        .await
        .unwrap();
    let file = anonymizer.proceed(&acme, &view.id).await.unwrap();

    assert!(matches!(
        anonymizer.get_audit_log(&globex, &file.id).await.unwrap_err(),
        AnonymizeError::FileNotFound(_)
    ));
    assert!(matches!(
        anonymizer.download(&globex, &file.id).await.unwrap_err(),
        AnonymizeError::FileNotFound(_)
    ));
    assert!(matches!(
        anonymizer
            .toggle_anonymization(&globex, &file.id)
            .await
            .unwrap_err(),
        AnonymizeError::FileNotFound(_)
    ));
    assert!(anonymizer.list_files(&globex).await.unwrap().is_empty());
    assert_eq!(anonymizer.list_files(&acme).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_session_isolation() {
    let anonymizer = with_detector(StaticDetector::new(acme_candidates()));
    let acme = register(&anonymizer, "Acme").await;
    let globex = register(&anonymizer, "Globex").await;
    let view = anonymizer
        .upload(&acme, "notes.txt", ACME_TEXT.as_bytes())
        .await
        .unwrap();

    assert!(matches!(
        anonymizer.session(&globex, &view.id).unwrap_err(),
        AnonymizeError::SessionNotFound(_)
    ));
    assert!(matches!(
        anonymizer
            .toggle_ignore(&globex, &view.id, "c-person")
            .unwrap_err(),
        AnonymizeError::SessionNotFound(_)
    ));
    assert!(matches!(
        anonymizer.proceed(&globex, &view.id).await.unwrap_err(),
        AnonymizeError::SessionNotFound(_)
    ));
    assert!(matches!(
        anonymizer.cancel(&globex, &view.id).await.unwrap_err(),
        AnonymizeError::SessionNotFound(_)
    ));

    // Acme's review is untouched and still commits
    assert_eq!(anonymizer.session(&acme, &view.id).unwrap(), view);
    let file = anonymizer.proceed(&acme, &view.id).await.unwrap();
    assert_eq!(file.state, FileState::Anonymized);
}

// ─── Concurrency ─────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_proceed_single_winner() {
    let anonymizer = with_detector(StaticDetector::new(acme_candidates()));
    let partner_id = register(&anonymizer, "Acme").await;
    let view = anonymizer
        .upload(&partner_id, "notes.txt", ACME_TEXT.as_bytes())
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..2 {
        let anonymizer = anonymizer.clone();
        let partner_id = partner_id.clone();
        let session_id = view.id.clone();
        handles.push(tokio::spawn(async move {
            anonymizer.proceed(&partner_id, &session_id).await
        }));
    }

    let mut succeeded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(file) => {
                assert_eq!(file.state, FileState::Anonymized);
                succeeded += 1;
            }
            Err(AnonymizeError::FileBusy(_)) | Err(AnonymizeError::SessionNotFound(_)) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(succeeded, 1);

    let file = anonymizer.file(&partner_id, &view.file_id).await.unwrap();
    assert_eq!(file.state, FileState::Anonymized);
    let audit = anonymizer
        .get_audit_log(&partner_id, &view.file_id)
        .await
        .unwrap();
    assert_eq!(audit.count_for(EntityCategory::Person), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_toggles_on_one_file() {
    let anonymizer = with_detector(StaticDetector::new(acme_candidates()));
    let partner_id = register(&anonymizer, "Acme").await;
    let view = anonymizer
        .upload(&partner_id, "notes.txt", ACME_TEXT.as_bytes())
        .await
        .unwrap();
    let file = anonymizer.proceed(&partner_id, &view.id).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let anonymizer = anonymizer.clone();
        let partner_id = partner_id.clone();
        let file_id = file.id.clone();
        handles.push(tokio::spawn(async move {
            anonymizer.toggle_anonymization(&partner_id, &file_id).await
        }));
    }

    let mut toggles = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => toggles += 1,
            Err(AnonymizeError::FileBusy(_)) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert!(toggles >= 1);

    let expected = if toggles % 2 == 1 {
        FileState::DeAnonymized
    } else {
        FileState::Anonymized
    };
    let after = anonymizer.file(&partner_id, &file.id).await.unwrap();
    assert_eq!(after.state, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_independent_files_do_not_contend() {
    let anonymizer = with_detector(StaticDetector::new(acme_candidates()));
    let partner_id = register(&anonymizer, "Acme").await;

    let mut sessions = Vec::new();
    for i in 0..8 {
        let view = anonymizer
            .upload(&partner_id, &format!("notes-{}.txt", i), ACME_TEXT.as_bytes())
            .await
            .unwrap();
        sessions.push(view.id);
    }

    let mut handles = Vec::new();
    for session_id in sessions {
        let anonymizer = anonymizer.clone();
        let partner_id = partner_id.clone();
        handles.push(tokio::spawn(async move {
            anonymizer.proceed(&partner_id, &session_id).await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    let files = anonymizer.list_files(&partner_id).await.unwrap();
    assert_eq!(files.len(), 8);
    assert!(files.iter().all(|f| f.state == FileState::Anonymized));
}
