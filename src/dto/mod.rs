pub mod admin_dto;
pub mod callback_dto;
