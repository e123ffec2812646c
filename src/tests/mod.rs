
mod test_admission_engine;
mod test_token_bucket;
