pub mod order_reconciliation;
