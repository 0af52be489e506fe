pub mod add_password;
pub mod nohup;
pub mod run;
