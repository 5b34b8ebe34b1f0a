mod common;

use async_trait::async_trait;
use common::FakeAuthority;
use factura_core::{
    InvoiceService, SriStatus, SubmissionOutcome,
    model::{Invoice, PdfStatus},
    sequencer::Sequencer,
    store::{DocumentStore, InMemoryStore},
    submission::{MISSING_CERTIFICATE_MESSAGE, SubmissionRunner, SubmissionWorker},
};
use serde_json::json;
use std::sync::Arc;

struct Idle;

#[async_trait]
impl SubmissionRunner for Idle {
    async fn run(&self, _invoice_id: &str) -> SubmissionOutcome {
        SubmissionOutcome::NotFound
    }
}

/// Seed a pending invoice through the normal issuance path.
async fn pending_invoice(store: &Arc<InMemoryStore>) -> Invoice {
    let (queue, worker) = SubmissionWorker::spawn(Arc::new(Idle));
    let service = InvoiceService::new(
        store.clone(),
        Arc::new(Sequencer::new()),
        Arc::new(common::TemplateXmlBuilder),
        queue,
    );
    let issued = service.issue(common::request(&["P001"])).await.expect("issue");
    worker.shutdown().await;
    issued.invoice
}

#[tokio::test]
async fn received_invoice_gets_generated_pdf() {
    let dir = tempfile::tempdir().unwrap();
    let store = common::seeded_store(common::company(Some(common::p12_blob("admin")), Some("admin"))).await;
    let invoice = pending_invoice(&store).await;
    let authority = Arc::new(FakeAuthority::receiving());
    let orchestrator = common::orchestrator(store.clone(), authority.clone(), false, dir.path());

    let outcome = orchestrator.run(&invoice.id).await;
    assert_eq!(outcome, SubmissionOutcome::Received { pdf: PdfStatus::Generado });

    let stored = store.invoice(&invoice.id).await.unwrap().unwrap();
    assert_eq!(stored.sri_status, SriStatus::Recibida);
    assert!(stored.signed_xml.as_deref().unwrap().contains(&invoice.access_key));

    let pdf = store
        .invoice_pdf_by_access_key(&invoice.access_key)
        .await
        .unwrap()
        .expect("pdf record");
    assert_eq!(pdf.status, PdfStatus::Generado);
    assert_eq!(pdf.invoice_id, invoice.id);
    assert_eq!(pdf.authorization_number, invoice.access_key);
    assert_eq!(pdf.provider, "local");
    assert!(pdf.url.starts_with("http://files.test/pdfs/factura_000000001_"));
    assert!(pdf.size > 0);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

    // A second run finds nothing to do.
    assert_eq!(
        orchestrator.run(&invoice.id).await,
        SubmissionOutcome::Skipped(SriStatus::Recibida)
    );
    assert_eq!(authority.calls(), 1);
}

#[tokio::test]
async fn pdf_failure_is_recorded_without_touching_invoice() {
    let dir = tempfile::tempdir().unwrap();
    let store = common::seeded_store(common::company(Some(common::p12_blob("admin")), Some("admin"))).await;
    let invoice = pending_invoice(&store).await;
    let orchestrator =
        common::orchestrator(store.clone(), Arc::new(FakeAuthority::receiving()), true, dir.path());

    let outcome = orchestrator.run(&invoice.id).await;
    assert_eq!(outcome, SubmissionOutcome::Received { pdf: PdfStatus::Error });

    let stored = store.invoice(&invoice.id).await.unwrap().unwrap();
    assert_eq!(stored.sri_status, SriStatus::Recibida);
    let pdf = store
        .invoice_pdf_by_access_key(&invoice.access_key)
        .await
        .unwrap()
        .expect("pdf record");
    assert_eq!(pdf.status, PdfStatus::Error);
    assert_eq!(pdf.url, "");
    assert_eq!(pdf.provider, "error");
    assert_eq!(pdf.size, 0);
}

#[tokio::test]
async fn missing_certificate_is_a_signature_error() {
    let dir = tempfile::tempdir().unwrap();
    let store = common::seeded_store(common::company(None, None)).await;
    let invoice = pending_invoice(&store).await;
    let authority = Arc::new(FakeAuthority::receiving());
    let orchestrator = common::orchestrator(store.clone(), authority.clone(), false, dir.path());

    let outcome = orchestrator.run(&invoice.id).await;
    assert!(matches!(outcome, SubmissionOutcome::SigningFailed(_)));

    let stored = store.invoice(&invoice.id).await.unwrap().unwrap();
    assert_eq!(stored.sri_status, SriStatus::ErrorFirma);
    assert_eq!(
        stored.sri_messages,
        Some(json!({ "mensaje": MISSING_CERTIFICATE_MESSAGE }))
    );
    assert_eq!(stored.signed_xml, None);
    assert_eq!(authority.calls(), 0);
}

#[tokio::test]
async fn unopenable_certificate_is_a_signature_error() {
    let dir = tempfile::tempdir().unwrap();
    let store = common::seeded_store(common::company(
        Some(common::p12_blob("Un1que-Pass")),
        Some("wrong"),
    ))
    .await;
    let invoice = pending_invoice(&store).await;
    let authority = Arc::new(FakeAuthority::receiving());
    let orchestrator = common::orchestrator(store.clone(), authority.clone(), false, dir.path());

    assert!(matches!(
        orchestrator.run(&invoice.id).await,
        SubmissionOutcome::SigningFailed(_)
    ));
    let stored = store.invoice(&invoice.id).await.unwrap().unwrap();
    assert_eq!(stored.sri_status, SriStatus::ErrorFirma);
    let message = stored.sri_messages.unwrap()["error"].as_str().unwrap().to_string();
    assert!(message.contains("no working certificate password"));
    assert_eq!(authority.calls(), 0);
}

#[tokio::test]
async fn recovered_password_still_signs() {
    let dir = tempfile::tempdir().unwrap();
    let store =
        common::seeded_store(common::company(Some(common::p12_blob("admin")), Some("wrong"))).await;
    let invoice = pending_invoice(&store).await;
    let orchestrator =
        common::orchestrator(store.clone(), Arc::new(FakeAuthority::receiving()), false, dir.path());

    assert_eq!(
        orchestrator.run(&invoice.id).await,
        SubmissionOutcome::Received { pdf: PdfStatus::Generado }
    );
    // The stored password is left as it was.
    let company = store.company("company-1").await.unwrap().unwrap();
    assert_eq!(company.certificate_password.as_deref(), Some("wrong"));
}

#[tokio::test]
async fn transport_failure_is_a_process_error_after_signing() {
    let dir = tempfile::tempdir().unwrap();
    let store = common::seeded_store(common::company(Some(common::p12_blob("admin")), Some("admin"))).await;
    let invoice = pending_invoice(&store).await;
    let orchestrator =
        common::orchestrator(store.clone(), Arc::new(FakeAuthority::unreachable()), false, dir.path());

    assert!(matches!(
        orchestrator.run(&invoice.id).await,
        SubmissionOutcome::ProcessFailed(msg) if msg.contains("connection refused")
    ));
    let stored = store.invoice(&invoice.id).await.unwrap().unwrap();
    assert_eq!(stored.sri_status, SriStatus::ErrorProceso);
    assert!(stored.signed_xml.is_some());
    assert!(stored.sri_sent_at.is_some());
    assert!(stored.sri_messages.unwrap()["error"].is_string());
    assert!(store.invoice_pdfs().await.is_empty());
}

#[tokio::test]
async fn other_authority_status_is_stored_verbatim() {
    let dir = tempfile::tempdir().unwrap();
    let store = common::seeded_store(common::company(Some(common::p12_blob("admin")), Some("admin"))).await;
    let invoice = pending_invoice(&store).await;
    let orchestrator = common::orchestrator(
        store.clone(),
        Arc::new(FakeAuthority::answering("DEVUELTA")),
        false,
        dir.path(),
    );

    assert_eq!(
        orchestrator.run(&invoice.id).await,
        SubmissionOutcome::Authority(SriStatus::Authority("DEVUELTA".into()))
    );
    let stored = store.invoice(&invoice.id).await.unwrap().unwrap();
    assert_eq!(stored.sri_status.as_str(), "DEVUELTA");
    assert!(store.invoice_pdfs().await.is_empty());
}

#[tokio::test]
async fn unknown_and_settled_invoices_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let store = common::seeded_store(common::company(Some(common::p12_blob("admin")), Some("admin"))).await;
    let invoice = pending_invoice(&store).await;
    let authority = Arc::new(FakeAuthority::receiving());
    let orchestrator = common::orchestrator(store.clone(), authority.clone(), false, dir.path());

    assert_eq!(orchestrator.run("missing").await, SubmissionOutcome::NotFound);

    let mut failed = invoice.clone();
    failed.sri_status = SriStatus::ErrorProceso;
    store.update_invoice(&failed).await.unwrap();
    assert_eq!(
        orchestrator.run(&invoice.id).await,
        SubmissionOutcome::Skipped(SriStatus::ErrorProceso)
    );
    assert_eq!(authority.calls(), 0);
}
