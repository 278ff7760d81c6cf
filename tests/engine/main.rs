mod engine_test;
mod statement_test;
