use super::*;

use serde_json::Value;

pub const BUCKET_LOGICAL_ID: &str = "SiteBucket";
pub const BUCKET_POLICY_LOGICAL_ID: &str = "SiteBucketPolicy";
pub const ORIGIN_ACCESS_IDENTITY_LOGICAL_ID: &str = "SiteOriginAccessIdentity";
pub const CLEANUP_ROLE_LOGICAL_ID: &str = "SiteBucketCleanupRole";
pub const CLEANUP_FUNCTION_LOGICAL_ID: &str = "SiteBucketCleanupFunction";
pub const CLEANUP_RESOURCE_LOGICAL_ID: &str = "SiteBucketAutoDeleteObjects";
pub const CLEANUP_RESOURCE_TYPE: &str = "Custom::S3AutoDeleteObjects";

/// deletes every object of the bucket when the custom resource is deleted,
/// so the bucket itself can be removed with the stack.
const CLEANUP_FUNCTION_CODE: &str = r#"
const { S3Client, ListObjectsV2Command, DeleteObjectsCommand } = require('@aws-sdk/client-s3');
const response = require('cfn-response');
const s3 = new S3Client({});
async function emptyBucket(bucketName) {
    let token = undefined;
    do {
        const page = await s3.send(new ListObjectsV2Command({ Bucket: bucketName, ContinuationToken: token }));
        const objects = (page.Contents || []).map(o => ({ Key: o.Key }));
        if (objects.length > 0) {
            await s3.send(new DeleteObjectsCommand({ Bucket: bucketName, Delete: { Objects: objects, Quiet: true } }));
        }
        token = page.NextContinuationToken;
    } while (token);
}
// cfn-response signals completion through context.done once its PUT returns
function sendResponse(event, context, responseType, physicalResourceId) {
    return new Promise(resolve => {
        context.done = resolve;
        response.send(event, context, responseType, {}, physicalResourceId);
    });
}
exports.handler = async function(event, context) {
    // stable per bucket, so an update never replaces (and deletes) the resource
    const physicalResourceId = 'empty-' + event.ResourceProperties.BucketName;
    let responseType = response.SUCCESS;
    if (event.RequestType == 'Delete') {
        try {
            await emptyBucket(event.ResourceProperties.BucketName);
        } catch (err) {
            console.log(err);
            responseType = response.FAILED;
        }
    }
    await sendResponse(event, context, responseType, physicalResourceId);
}
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketRef {
    pub logical_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginAccessIdentityRef {
    pub logical_id: String,
}

/// Private bucket for the built assets. Every public access path is
/// blocked; reads only go through the origin access identity grant.
/// The bucket is removed with its stack; with `auto_delete_objects` its
/// contents are purged first so the removal can succeed.
pub fn create_bucket(unit: &mut StackUnit, auto_delete_objects: bool) -> Result<BucketRef> {
    let bucket = Resource::new(
        "AWS::S3::Bucket",
        json!({
            "PublicAccessBlockConfiguration": {
                "BlockPublicAcls": true,
                "BlockPublicPolicy": true,
                "IgnorePublicAcls": true,
                "RestrictPublicBuckets": true,
            },
            "OwnershipControls": {
                "Rules": [{ "ObjectOwnership": "BucketOwnerEnforced" }],
            },
            "BucketEncryption": {
                "ServerSideEncryptionConfiguration": [{
                    "ServerSideEncryptionByDefault": { "SSEAlgorithm": "AES256" },
                }],
            },
        }),
    )
    .destroy_with_stack();
    unit.template.add_resource(BUCKET_LOGICAL_ID, bucket)?;
    let out = BucketRef {
        logical_id: BUCKET_LOGICAL_ID.to_string(),
    };
    if auto_delete_objects {
        add_cleanup_resources(unit, &out)?;
    }
    Ok(out)
}

pub fn create_origin_access_identity(unit: &mut StackUnit, comment: &str) -> Result<OriginAccessIdentityRef> {
    let identity = Resource::new(
        "AWS::CloudFront::CloudFrontOriginAccessIdentity",
        json!({
            "CloudFrontOriginAccessIdentityConfig": { "Comment": comment },
        }),
    );
    unit.template.add_resource(ORIGIN_ACCESS_IDENTITY_LOGICAL_ID, identity)?;
    Ok(OriginAccessIdentityRef {
        logical_id: ORIGIN_ACCESS_IDENTITY_LOGICAL_ID.to_string(),
    })
}

/// Lets the identity read objects. `s3:ListBucket` is included so a missing
/// key answers 404 instead of 403, which the distribution rewrites.
pub fn grant_read(unit: &mut StackUnit, bucket: &BucketRef, identity: &OriginAccessIdentityRef) -> Result<()> {
    let principal = json!({
        "CanonicalUser": get_att(&identity.logical_id, "S3CanonicalUserId"),
    });
    let policy = Resource::new(
        "AWS::S3::BucketPolicy",
        json!({
            "Bucket": get_ref(&bucket.logical_id),
            "PolicyDocument": {
                "Version": "2012-10-17",
                "Statement": [
                    {
                        "Effect": "Allow",
                        "Principal": principal,
                        "Action": "s3:GetObject",
                        "Resource": sub(&format!("arn:${{AWS::Partition}}:s3:::${{{}}}/*", bucket.logical_id)),
                    },
                    {
                        "Effect": "Allow",
                        "Principal": principal,
                        "Action": "s3:ListBucket",
                        "Resource": get_att(&bucket.logical_id, "Arn"),
                    },
                ],
            },
        }),
    );
    unit.template.add_resource(BUCKET_POLICY_LOGICAL_ID, policy)
}

pub fn create_assume_role_policy_doc() -> Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Service": "lambda.amazonaws.com" },
            "Action": "sts:AssumeRole",
        }],
    })
}

fn add_cleanup_resources(unit: &mut StackUnit, bucket: &BucketRef) -> Result<()> {
    let role = Resource::new(
        "AWS::IAM::Role",
        json!({
            "Description": format!("empties {} before stack deletion", bucket.logical_id),
            "AssumeRolePolicyDocument": create_assume_role_policy_doc(),
            "ManagedPolicyArns": [
                sub("arn:${AWS::Partition}:iam::aws:policy/service-role/AWSLambdaBasicExecutionRole"),
            ],
            "Policies": [{
                "PolicyName": "empty-site-bucket",
                "PolicyDocument": {
                    "Version": "2012-10-17",
                    "Statement": [
                        {
                            "Effect": "Allow",
                            "Action": "s3:ListBucket",
                            "Resource": get_att(&bucket.logical_id, "Arn"),
                        },
                        {
                            "Effect": "Allow",
                            "Action": "s3:DeleteObject",
                            "Resource": sub(&format!("arn:${{AWS::Partition}}:s3:::${{{}}}/*", bucket.logical_id)),
                        },
                    ],
                },
            }],
        }),
    );
    let function = Resource::new(
        "AWS::Lambda::Function",
        json!({
            "Runtime": "nodejs20.x",
            "Handler": "index.handler",
            "Timeout": 900,
            "Role": get_att(CLEANUP_ROLE_LOGICAL_ID, "Arn"),
            "Code": { "ZipFile": CLEANUP_FUNCTION_CODE },
        }),
    );
    let cleanup = Resource::new(
        CLEANUP_RESOURCE_TYPE,
        json!({
            "ServiceToken": get_att(CLEANUP_FUNCTION_LOGICAL_ID, "Arn"),
            "BucketName": get_ref(&bucket.logical_id),
        }),
    );
    unit.template.add_resource(CLEANUP_ROLE_LOGICAL_ID, role)?;
    unit.template.add_resource(CLEANUP_FUNCTION_LOGICAL_ID, function)?;
    unit.template.add_resource(CLEANUP_RESOURCE_LOGICAL_ID, cleanup)?;
    Ok(())
}
