//! Lending engine behaviour over the in-memory backend

use std::sync::Arc;

use lending_server::{
    models::{LoanQuery, LoanStatus},
    repository::{memory::MemoryStore, BookCatalog, LoanLedger},
    services::lending::ReconcileAction,
    AppError,
};
use tokio_test::{assert_err, assert_ok};

use crate::common::{GatedLedger, Library, ADMIN};

#[tokio::test]
async fn borrow_and_return_round_trip() {
    let library = Library::new();
    let book = library.add_book("Brave New World").await;
    let alice = library.add_student("alice@example.org").await;
    let bob = library.add_student("bob@example.org").await;

    let loan = assert_ok!(library.services.lending.borrow(book.id, alice.user_id, &alice).await);
    assert_eq!(loan.status, LoanStatus::Active);
    assert!(loan.return_date.is_none());
    assert!(!library.book(book.id).await.availability);
    library.assert_consistent().await;

    let returned = assert_ok!(library.services.lending.return_loan(loan.id, &alice).await);
    assert_eq!(returned.status, LoanStatus::Returned);
    assert!(returned.return_date.is_some());
    assert!(library.book(book.id).await.availability);
    library.assert_consistent().await;

    // The same book can be lent again
    let second = assert_ok!(library.services.lending.borrow(book.id, bob.user_id, &bob).await);
    assert_ne!(second.id, loan.id);
    library.assert_consistent().await;
}

#[tokio::test]
async fn borrowing_an_unavailable_book_fails() {
    let library = Library::new();
    let book = library.add_book("Neuromancer").await;
    let alice = library.add_student("alice@example.org").await;
    let bob = library.add_student("bob@example.org").await;

    assert_ok!(library.services.lending.borrow(book.id, alice.user_id, &alice).await);
    let err = assert_err!(library.services.lending.borrow(book.id, bob.user_id, &bob).await);
    assert!(matches!(err, AppError::AlreadyBorrowed(id) if id == book.id));
    library.assert_consistent().await;
}

#[tokio::test]
async fn students_borrow_only_for_themselves() {
    let library = Library::new();
    let book = library.add_book("Solaris").await;
    let alice = library.add_student("alice@example.org").await;
    let bob = library.add_student("bob@example.org").await;

    let err = assert_err!(library.services.lending.borrow(book.id, bob.user_id, &alice).await);
    assert!(matches!(err, AppError::Authorization(_)));
    assert!(library.book(book.id).await.availability);

    // Admins may lend on a student's behalf
    assert_ok!(library.services.lending.borrow(book.id, bob.user_id, &ADMIN).await);
}

#[tokio::test]
async fn unknown_book_or_student_is_not_found() {
    let library = Library::new();
    let book = library.add_book("Ubik").await;
    let alice = library.add_student("alice@example.org").await;

    let err = assert_err!(library.services.lending.borrow(999, alice.user_id, &alice).await);
    assert!(matches!(err, AppError::NotFound(_)));

    let err = assert_err!(library.services.lending.borrow(book.id, 999, &ADMIN).await);
    assert!(matches!(err, AppError::NotFound(_)));
    assert!(library.book(book.id).await.availability);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_borrows_have_a_single_winner() {
    let library = Library::new();
    let book = library.add_book("The Left Hand of Darkness").await;

    let mut students = Vec::new();
    for i in 0..16 {
        students.push(library.add_student(&format!("student{}@example.org", i)).await);
    }

    let mut handles = Vec::new();
    for student in students {
        let lending = library.services.lending.clone();
        let book_id = book.id;
        handles.push(tokio::spawn(async move {
            lending.borrow(book_id, student.user_id, &student).await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        match handle.await.expect("task completes") {
            Ok(_) => winners += 1,
            Err(AppError::AlreadyBorrowed(_)) | Err(AppError::Conflict(_)) => {}
            Err(other) => panic!("unexpected error: {:?}", other),
        }
    }
    assert_eq!(winners, 1);

    let active = library
        .services
        .lending
        .list_loans(
            &LoanQuery {
                book_id: Some(book.id),
                status: Some(LoanStatus::Active),
                ..Default::default()
            },
            &ADMIN,
        )
        .await
        .expect("list loans");
    assert_eq!(active.len(), 1);
    library.assert_consistent().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_returns_release_once() {
    let library = Library::new();
    let book = library.add_book("Kindred").await;
    let alice = library.add_student("alice@example.org").await;
    let loan = assert_ok!(library.services.lending.borrow(book.id, alice.user_id, &alice).await);

    let loan_id = loan.id;
    let mut handles = Vec::new();
    for _ in 0..8 {
        let lending = library.services.lending.clone();
        handles.push(tokio::spawn(async move { lending.return_loan(loan_id, &alice).await }));
    }

    let mut returned = 0;
    for handle in handles {
        match handle.await.expect("task completes") {
            Ok(_) => returned += 1,
            Err(AppError::AlreadyReturned(_)) => {}
            Err(other) => panic!("unexpected error: {:?}", other),
        }
    }
    assert_eq!(returned, 1);

    let book = library.book(book.id).await;
    assert!(book.availability);
    // Claim, confirmation and release, nothing more
    assert_eq!(book.version, 3);
}

#[tokio::test]
async fn second_return_is_rejected() {
    let library = Library::new();
    let book = library.add_book("Foundation").await;
    let alice = library.add_student("alice@example.org").await;
    let loan = assert_ok!(library.services.lending.borrow(book.id, alice.user_id, &alice).await);

    assert_ok!(library.services.lending.return_loan(loan.id, &alice).await);
    let version = library.book(book.id).await.version;

    let err = assert_err!(library.services.lending.return_loan(loan.id, &alice).await);
    assert!(matches!(err, AppError::AlreadyReturned(id) if id == loan.id));
    assert_eq!(library.book(book.id).await.version, version);
}

#[tokio::test]
async fn only_the_borrower_or_an_admin_returns() {
    let library = Library::new();
    let book = library.add_book("Hyperion").await;
    let alice = library.add_student("alice@example.org").await;
    let bob = library.add_student("bob@example.org").await;
    let loan = assert_ok!(library.services.lending.borrow(book.id, alice.user_id, &alice).await);

    let err = assert_err!(library.services.lending.return_loan(loan.id, &bob).await);
    assert!(matches!(err, AppError::Authorization(_)));
    let err = assert_err!(library.services.lending.get_loan(loan.id, &bob).await);
    assert!(matches!(err, AppError::Authorization(_)));

    assert_ok!(library.services.lending.return_loan(loan.id, &ADMIN).await);
}

#[tokio::test]
async fn deleting_an_active_loan_frees_the_book() {
    let library = Library::new();
    let book = library.add_book("Dune").await;
    let alice = library.add_student("alice@example.org").await;
    let bob = library.add_student("bob@example.org").await;
    let loan = assert_ok!(library.services.lending.borrow(book.id, alice.user_id, &alice).await);

    assert_ok!(library.services.lending.delete_loan(loan.id, &ADMIN).await);

    assert!(library.book(book.id).await.availability);
    let err = assert_err!(library.services.lending.get_loan(loan.id, &ADMIN).await);
    assert!(matches!(err, AppError::NotFound(_)));
    library.assert_consistent().await;

    let next = assert_ok!(library.services.lending.borrow(book.id, bob.user_id, &bob).await);
    assert_eq!(next.student_id, bob.user_id);
    assert!(!library.book(book.id).await.availability);
    library.assert_consistent().await;
}

#[tokio::test]
async fn deleting_a_returned_loan_leaves_the_book_alone() {
    let library = Library::new();
    let book = library.add_book("Snow Crash").await;
    let alice = library.add_student("alice@example.org").await;
    let loan = assert_ok!(library.services.lending.borrow(book.id, alice.user_id, &alice).await);
    assert_ok!(library.services.lending.return_loan(loan.id, &alice).await);
    let version = library.book(book.id).await.version;

    assert_ok!(library.services.lending.delete_loan(loan.id, &ADMIN).await);
    let book = library.book(book.id).await;
    assert!(book.availability);
    assert_eq!(book.version, version);

    let err = assert_err!(library.services.lending.delete_loan(loan.id, &ADMIN).await);
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn lent_books_cannot_be_deleted() {
    let library = Library::new();
    let book = library.add_book("1984").await;
    let alice = library.add_student("alice@example.org").await;
    let loan = assert_ok!(library.services.lending.borrow(book.id, alice.user_id, &alice).await);

    let err = assert_err!(library.services.lending.delete_book(book.id, &ADMIN).await);
    assert!(matches!(err, AppError::Conflict(_)));
    assert!(!library.book(book.id).await.availability);

    assert_ok!(library.services.lending.return_loan(loan.id, &alice).await);
    assert_ok!(library.services.lending.delete_book(book.id, &ADMIN).await);

    let err = assert_err!(library.services.catalog.get_book(book.id, &ADMIN).await);
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn stranded_books_point_to_reconcile_instead_of_a_loan() {
    let library = Library::new();
    let book = library.add_book("Neuromancer").await;
    assert_ok!(
        library
            .repository
            .books
            .set_availability_if_version(book.id, book.version, false)
            .await
    );

    match library.services.lending.delete_book(book.id, &ADMIN).await {
        Err(AppError::Conflict(message)) => {
            assert!(message.contains("no active loan"), "{}", message);
            assert!(message.contains(&format!("/books/{}/reconcile", book.id)), "{}", message);
        }
        other => panic!("expected conflict, got {:?}", other),
    }

    assert_ok!(library.services.lending.reconcile_book(book.id, &ADMIN).await);
    assert_ok!(library.services.lending.delete_book(book.id, &ADMIN).await);
}

#[tokio::test]
async fn loan_listing_carries_projections_and_filters() {
    let library = Library::new();
    let dune = library.add_book("Dune").await;
    let emma = library.add_book("Emma").await;
    let alice = library.add_student("alice@example.org").await;
    let bob = library.add_student("bob@example.org").await;

    let first = assert_ok!(library.services.lending.borrow(dune.id, alice.user_id, &alice).await);
    assert_ok!(library.services.lending.return_loan(first.id, &alice).await);
    assert_ok!(library.services.lending.borrow(emma.id, bob.user_id, &bob).await);

    let all = assert_ok!(library.services.lending.list_loans(&LoanQuery::default(), &alice).await);
    assert_eq!(all.len(), 2);
    let dune_loan = all.iter().find(|l| l.book_id == dune.id).expect("dune loan listed");
    assert_eq!(dune_loan.book.as_ref().map(|b| b.title.as_str()), Some("Dune"));
    assert_eq!(
        dune_loan.student.as_ref().map(|s| s.email.as_str()),
        Some("alice@example.org")
    );

    let active = assert_ok!(
        library
            .services
            .lending
            .list_loans(
                &LoanQuery {
                    status: Some(LoanStatus::Active),
                    ..Default::default()
                },
                &ADMIN,
            )
            .await
    );
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].student_id, bob.user_id);
}

#[tokio::test]
async fn reconcile_restores_a_stranded_book() {
    let library = Library::new();
    let book = library.add_book("Stranded").await;

    // Simulate a crash between claiming the book and recording the loan
    let claimed = library
        .repository
        .books
        .set_availability_if_version(book.id, book.version, false)
        .await
        .expect("claim");
    assert!(claimed.is_applied());

    let violations = assert_ok!(library.services.lending.audit(&ADMIN).await);
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].book_id, book.id);
    assert_eq!(violations[0].availability, Some(false));
    assert!(violations[0].active_loan_ids.is_empty());

    let report = assert_ok!(library.services.lending.reconcile_book(book.id, &ADMIN).await);
    assert_eq!(report.action, ReconcileAction::AvailabilityRestored);
    assert!(report.book.availability);
    library.assert_consistent().await;

    let report = assert_ok!(library.services.lending.reconcile_book(book.id, &ADMIN).await);
    assert_eq!(report.action, ReconcileAction::AlreadyConsistent);
}

#[tokio::test]
async fn reconcile_leaves_lent_books_alone() {
    let library = Library::new();
    let book = library.add_book("Lent").await;
    let alice = library.add_student("alice@example.org").await;
    assert_ok!(library.services.lending.borrow(book.id, alice.user_id, &alice).await);

    let report = assert_ok!(library.services.lending.reconcile_book(book.id, &ADMIN).await);
    assert_eq!(report.action, ReconcileAction::AlreadyConsistent);
    assert!(!report.book.availability);

    let err = assert_err!(library.services.lending.reconcile_book(book.id, &alice).await);
    assert!(matches!(err, AppError::Authorization(_)));
}

#[tokio::test]
async fn reconcile_during_a_borrow_never_frees_a_lent_book() {
    let store = MemoryStore::new();
    let gate = Arc::new(GatedLedger::new(store.loan_ledger()));
    let library = Library::with_ledger(&store, gate.clone());
    let book = library.add_book("Solaris").await;
    let alice = library.add_student("alice@example.org").await;

    let lending = library.services.lending.clone();
    let book_id = book.id;
    let borrow = tokio::spawn(async move { lending.borrow(book_id, alice.user_id, &alice).await });

    // Book claimed, loan not yet recorded: it looks stranded
    gate.entered.notified().await;
    let report = assert_ok!(library.services.lending.reconcile_book(book.id, &ADMIN).await);
    assert_eq!(report.action, ReconcileAction::AvailabilityRestored);
    gate.open.notify_one();

    let err = assert_err!(borrow.await.expect("task completes"));
    assert!(matches!(err, AppError::Conflict(_)));
    assert!(library.book(book.id).await.availability);
    let active = assert_ok!(library.repository.loans.active_for_book(book.id).await);
    assert!(active.is_empty());
    library.assert_consistent().await;

    gate.open.notify_one();
    assert_ok!(library.services.lending.borrow(book.id, alice.user_id, &alice).await);
    library.assert_consistent().await;
}

#[tokio::test]
async fn deleting_a_student_during_their_borrow_leaves_no_loan_behind() {
    let store = MemoryStore::new();
    let gate = Arc::new(GatedLedger::new(store.loan_ledger()));
    let library = Library::with_ledger(&store, gate.clone());
    let book = library.add_book("Ubik").await;
    let alice = library.add_student("alice@example.org").await;

    let lending = library.services.lending.clone();
    let book_id = book.id;
    let borrow = tokio::spawn(async move { lending.borrow(book_id, alice.user_id, &alice).await });

    // Student checked and book claimed; the loan insert is parked
    gate.entered.notified().await;
    assert_ok!(library.services.users.delete_user(alice.user_id, &ADMIN).await);
    gate.open.notify_one();

    let err = assert_err!(borrow.await.expect("task completes"));
    assert!(matches!(err, AppError::NotFound(_)));
    assert!(library.book(book.id).await.availability);

    let loans = assert_ok!(library.services.lending.list_loans(&LoanQuery::default(), &ADMIN).await);
    assert!(loans.is_empty());
    library.assert_consistent().await;
}

#[tokio::test]
async fn students_with_active_loans_cannot_be_deleted() {
    let library = Library::new();
    let book = library.add_book("Beloved").await;
    let alice = library.add_student("alice@example.org").await;
    let loan = assert_ok!(library.services.lending.borrow(book.id, alice.user_id, &alice).await);

    let err = assert_err!(library.services.users.delete_user(alice.user_id, &ADMIN).await);
    assert!(matches!(err, AppError::Conflict(_)));

    assert_ok!(library.services.lending.return_loan(loan.id, &alice).await);
    assert_ok!(library.services.users.delete_user(alice.user_id, &ADMIN).await);
    library.assert_consistent().await;
}
