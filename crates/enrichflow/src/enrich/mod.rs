//! Transaction enrichment: batched categorization plus recurring and
//! subscription detection.

pub mod categorize;
pub mod classifier;
pub mod detector;
pub mod merchant;
pub mod parsing;
pub mod recurring;
pub mod transactions;

pub use categorize::{CategorizationProcessor, CategorizeOutcome, Detection};
pub use classifier::{Classification, ClassificationItem, Classifier, ClassifierClient};
pub use detector::{DetectorConfig, DetectorStats, PatternDetector};
pub use transactions::{SubscriptionPeriod, Transaction, TransactionStore, TransactionsRepo};
