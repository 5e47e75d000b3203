tonic::include_proto!("helmet_service");

pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("helmet");
